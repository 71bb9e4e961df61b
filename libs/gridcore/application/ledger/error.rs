use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Grid initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid ledger configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
