//! Debug and introspection endpoints.
//!
//! These routes are intended for operator debugging; they expose the raw
//! pool and match state.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;

use crate::matches::MatchRecord;
use crate::registry::VmRecord;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/debug/vms", get(debug_vms))
}

#[derive(Debug, Serialize)]
struct DebugVmsResponse {
    #[serde(rename = "protectedVM")]
    protected_vm: Option<String>,
    #[serde(rename = "vmPool")]
    vm_pool: Vec<VmRecord>,
    matches: Vec<MatchRecord>,
}

async fn debug_vms(State(state): State<AppState>) -> impl IntoResponse {
    let mut vm_pool = state.fleet().registry().snapshot().await;
    vm_pool.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    let mut matches = state.matches().snapshot().await;
    matches.sort_by(|a, b| a.match_id.cmp(&b.match_id));

    Json(DebugVmsResponse {
        protected_vm: state.fleet().registry().protected().await,
        vm_pool,
        matches,
    })
}
