use crate::state::AppState;
use axum::Router;

pub mod dto;
pub mod handlers;
pub mod service;
pub mod store;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::session_routes())
        .merge(handlers::me_routes())
}
