use crate::group::GroupId;
use shared::Identifier;

pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no group assigned to client id: {0}")]
    NoGroupForClient(Identifier),

    #[error("no group registered with id {0}")]
    UnknownGroup(GroupId),

    #[error("no strategy distribution defined, create a strategy distribution and try again")]
    EmptyStrategyDistribution,

    #[error("invalid number of strategies: {strategies} for {groups} groups")]
    StrategyQuotaExceeded { strategies: usize, groups: usize },

    #[error("invalid round configuration: {0}")]
    InvalidConfiguration(String),

    #[error("event log codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("event log io error: {0}")]
    Io(#[from] std::io::Error),
}
