use crate::config::ServerConfig;
use crate::store::VictoriaStore;

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: VictoriaStore,
}
