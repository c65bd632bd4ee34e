pub mod handlers;
pub mod middleware;
pub mod responses;
pub mod routes;

pub use middleware::{idempotency_middleware, IDEMPOTENCY_KEY_HEADER, REPLAY_HEADER, REQUEST_ID_HEADER};
pub use routes::{create_router, with_http_layers, with_idempotency, AppState};
