use crate::detect::AnomalyEngine;
use crate::storage::AnomalyStore;

#[derive(Clone)]
pub struct AppState {
    pub store: AnomalyStore,
    pub engine: AnomalyEngine,
}
