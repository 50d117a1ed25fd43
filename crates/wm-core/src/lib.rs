pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod logs;
pub mod manager;
pub mod recipe;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use events::EventBus;
pub use manager::{MachineManager, ManagerConfig};
pub use recipe::{HttpRecipeLoader, RecipeLoader};
