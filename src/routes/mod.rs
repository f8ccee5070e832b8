pub mod current;
pub mod export;
pub mod health;
pub mod history;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(current::router())
                .merge(history::router())
                .merge(export::router()),
        )
        .with_state(state)
}
