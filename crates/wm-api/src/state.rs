use wm_core::MachineManager;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    pub manager: MachineManager,
    pub config: AppConfig,
}
