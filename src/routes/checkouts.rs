use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use crate::state::AppState;
use crate::handlers::checkout::{
    cancel_checkout, check_work, complete_checkout, create_checkout, delete_checkout,
    get_checkout, list_checkouts, process_stock, tally_checkout,
};
use crate::middleware::auth::require_auth;

pub fn routes(state: AppState) -> Router<AppState> {
    let open_routes = Router::new()
        .route("/checkouts", get(list_checkouts))
        .route("/checkouts/{id}", get(get_checkout));

    let protected_routes = Router::new()
        .route("/checkouts", post(create_checkout))
        .route("/checkouts/{id}", axum::routing::delete(delete_checkout))
        .route("/checkouts/{id}/check-work", post(check_work))
        .route("/checkouts/{id}/complete", post(complete_checkout))
        .route("/checkouts/{id}/tally", post(tally_checkout))
        .route("/checkouts/{id}/process-stock", post(process_stock))
        .route("/checkouts/{id}/cancel", post(cancel_checkout))
        .route_layer(middleware::from_fn_with_state(state, require_auth));

    open_routes.merge(protected_routes)
}
