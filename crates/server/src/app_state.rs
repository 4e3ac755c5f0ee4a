use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ctx: ApiContext,
}
