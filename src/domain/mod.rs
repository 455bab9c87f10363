mod classification;
mod email_address;
mod message;

pub use classification::ActionRequired;
pub use classification::Category;
pub use classification::Classification;
pub use classification::Sentiment;
pub use classification::TokenUsage;
pub use email_address::EmailAddress;
pub use message::Message;
