use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Html,
}

/// A message body as returned by the mail API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ItemBody {
    #[serde(rename = "contentType", default, deserialize_with = "lenient_content_type")]
    pub content_type: ContentType,
    #[serde(default)]
    pub content: String,
}

impl ItemBody {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            content: content.into(),
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Html,
            content: content.into(),
        }
    }

    /// Content with surrounding whitespace removed; empty bodies count as absent.
    pub fn trimmed(&self) -> Option<&str> {
        let trimmed = self.content.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

fn lenient_content_type<'de, D>(deserializer: D) -> Result<ContentType, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        Some("html") => ContentType::Html,
        _ => ContentType::Text,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EmailAddress {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Recipient {
    #[serde(rename = "emailAddress", default)]
    pub email_address: EmailAddress,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            email_address: EmailAddress {
                address: address.into(),
                name: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// One unread message, with the fields selected by the listing query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<Recipient>,
    #[serde(rename = "toRecipients", default)]
    pub to_recipients: Vec<Recipient>,
    #[serde(rename = "ccRecipients", default)]
    pub cc_recipients: Vec<Recipient>,
    #[serde(default)]
    pub body: Option<ItemBody>,
    #[serde(rename = "uniqueBody", default)]
    pub unique_body: Option<ItemBody>,
    #[serde(rename = "bodyPreview", default)]
    pub body_preview: Option<String>,
    #[serde(rename = "hasAttachments", default)]
    pub has_attachments: bool,
    #[serde(rename = "conversationId", default)]
    pub conversation_id: Option<String>,
    #[serde(rename = "internetMessageHeaders", default)]
    pub internet_message_headers: Vec<Header>,
    #[serde(rename = "receivedDateTime", default)]
    pub received_date_time: Option<String>,
}

impl RemoteMessage {
    pub fn sender_address(&self) -> &str {
        self.from
            .as_ref()
            .map(|r| r.email_address.address.as_str())
            .unwrap_or("")
    }

    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }

    pub fn preview(&self) -> &str {
        self.body_preview.as_deref().unwrap_or("")
    }

    /// First primary recipient, the address a reply would be sent from.
    pub fn primary_recipient(&self) -> Option<&str> {
        self.to_recipients
            .first()
            .map(|r| r.email_address.address.as_str())
    }

    /// Primary recipients followed by CC recipients.
    pub fn recipient_addresses(&self) -> Vec<String> {
        self.to_recipients
            .iter()
            .chain(self.cc_recipients.iter())
            .map(|r| r.email_address.address.clone())
            .collect()
    }
}

pub(crate) const MESSAGE_SELECT: &str = "id,subject,from,body,bodyPreview,uniqueBody,receivedDateTime,hasAttachments,toRecipients,ccRecipients,internetMessageHeaders,conversationId";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailFolder {
    pub id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "parentFolderId", default)]
    pub parent_folder_id: Option<String>,
}

/// One page of a collection response.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MovedMessage {
    pub id: String,
}
