pub mod discord;
pub mod traits;

pub use discord::DiscordMessenger;
pub use traits::{DirectMessenger, HistoryLimit, InboundHandler, InboundMessage, MessengerError};
