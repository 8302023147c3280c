//! Interactive-card payload construction.
//!
//! The sink expects `{"msg_type": "interactive", "card": {...}}` with a
//! header (title + template color) and a list of display elements. Signed
//! mode adds a `timestamp` and a base64 HMAC-SHA256 signature derived from
//! `"{timestamp}\n{secret}"`.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header template color. Encodes the report verdict at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CardTemplate {
    /// High-confidence issue.
    Red,
    /// Issue at medium confidence.
    Orange,
    /// No issue found.
    Yellow,
    /// Diagnosis ran on a possibly modified tree.
    Purple,
}

impl CardTemplate {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Orange => "orange",
            Self::Yellow => "yellow",
            Self::Purple => "purple",
        }
    }
}

/// A notification card ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Card {
    msg_type: &'static str,
    card: CardBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sign: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CardBody {
    header: CardHeader,
    elements: Vec<CardElement>,
}

#[derive(Debug, Clone, Serialize)]
struct CardHeader {
    title: PlainText,
    template: CardTemplate,
}

#[derive(Debug, Clone, Serialize)]
struct PlainText {
    tag: &'static str,
    content: String,
}

/// A display element: markdown text or a horizontal rule.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum CardElement {
    /// Markdown block.
    Markdown {
        /// Markdown source.
        content: String,
    },
    /// Horizontal rule.
    Hr {},
}

/// Builder for [`Card`].
#[derive(Debug, Clone)]
pub struct CardBuilder {
    title: String,
    template: CardTemplate,
    elements: Vec<CardElement>,
}

impl CardBuilder {
    #[must_use]
    pub fn new(title: impl Into<String>, template: CardTemplate) -> Self {
        Self {
            title: title.into(),
            template,
            elements: Vec::new(),
        }
    }

    /// Append a markdown block.
    #[must_use]
    pub fn markdown(mut self, content: impl Into<String>) -> Self {
        self.elements.push(CardElement::Markdown {
            content: content.into(),
        });
        self
    }

    /// Append a labeled field as a markdown line.
    #[must_use]
    pub fn field(self, label: &str, value: &str) -> Self {
        self.markdown(format!("**{label}:** {value}"))
    }

    /// Append a horizontal rule.
    #[must_use]
    pub fn divider(mut self) -> Self {
        self.elements.push(CardElement::Hr {});
        self
    }

    /// Finish the card, unsigned.
    #[must_use]
    pub fn build(self) -> Card {
        Card {
            msg_type: "interactive",
            card: CardBody {
                header: CardHeader {
                    title: PlainText {
                        tag: "plain_text",
                        content: self.title,
                    },
                    template: self.template,
                },
                elements: self.elements,
            },
            timestamp: None,
            sign: None,
        }
    }
}

impl Card {
    /// Attach a signature for sinks that require signed webhooks.
    ///
    /// The signature is HMAC-SHA256 keyed on `"{timestamp}\n{secret}"`
    /// over an empty message, base64-encoded.
    #[must_use]
    pub fn signed(mut self, secret: &str, timestamp: i64) -> Self {
        self.sign = Some(compute_signature(secret, timestamp));
        self.timestamp = Some(timestamp.to_string());
        self
    }

    /// Template color carried by this card.
    #[must_use]
    pub fn template(&self) -> CardTemplate {
        self.card.header.template
    }
}

/// Compute the signed-mode signature.
#[must_use]
pub fn compute_signature(secret: &str, timestamp: i64) -> String {
    let key = format!("{timestamp}\n{secret}");
    // A key of any length is accepted by HMAC; the expect cannot fire.
    let mac = HmacSha256::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    let signature = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(signature)
}
