pub mod client;
pub mod pagination;
pub mod token;
pub mod types;

pub use client::{GraphClient, GraphError};
pub use token::{AppCredentials, Credential, TokenError, TokenManager};
pub use types::{ContentType, Header, ItemBody, MailFolder, Page, Recipient, RemoteMessage};
