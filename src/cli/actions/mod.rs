pub mod server;

use anyhow::Result;

/// Action to execute, produced by CLI dispatch.
#[derive(Debug)]
pub enum Action {
    Server(Box<server::Args>),
}

impl Action {
    /// Execute the action.
    ///
    /// # Errors
    /// Returns an error if the underlying action fails.
    pub async fn execute(self) -> Result<()> {
        match self {
            Action::Server(args) => server::execute(*args).await,
        }
    }
}
