//! Card data model shared by producers, the cache store and the HTTP binding

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParallizerError;

/// Kind of a card. Declaration order is the display priority of the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardCategory {
    /// Clarifying questions and ambiguities about the document
    Question,
    /// Contextual material: related code, docs, search hits
    Context,
    /// Inline completion for ghost text
    Completion,
    Email,
    Math,
}

impl CardCategory {
    /// All categories in feed order
    pub const ALL: [CardCategory; 5] = [
        CardCategory::Question,
        CardCategory::Context,
        CardCategory::Completion,
        CardCategory::Email,
        CardCategory::Math,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardCategory::Question => "question",
            CardCategory::Context => "context",
            CardCategory::Completion => "completion",
            CardCategory::Email => "email",
            CardCategory::Math => "math",
        }
    }
}

impl fmt::Display for CardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardCategory {
    type Err = ParallizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CardCategory::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParallizerError::validation(format!("unknown card type '{s}'")))
    }
}

/// A single categorized result. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    header: String,
    text: String,
    category: CardCategory,
    metadata: Map<String, Value>,
}

impl Card {
    pub fn new(header: impl Into<String>, text: impl Into<String>, category: CardCategory) -> Self {
        Self {
            header: header.into(),
            text: text.into(),
            category,
            metadata: Map::new(),
        }
    }

    /// Builder-style metadata insertion, only usable before the card is shared
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn category(&self) -> CardCategory {
        self.category
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.text.chars().take(50).collect();
        write!(f, "[{}] {}: {}...", self.category, self.header, preview)
    }
}

/// Wire shape of a card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDto {
    pub header: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl From<&Card> for CardDto {
    fn from(card: &Card) -> Self {
        Self {
            header: card.header.clone(),
            text: card.text.clone(),
            kind: card.category.as_str().to_string(),
            metadata: card.metadata.clone(),
        }
    }
}

impl TryFrom<CardDto> for Card {
    type Error = ParallizerError;

    fn try_from(dto: CardDto) -> Result<Self, Self::Error> {
        let category = dto.kind.parse::<CardCategory>()?;
        Ok(Card {
            header: dto.header,
            text: dto.text,
            category,
            metadata: dto.metadata,
        })
    }
}

/// Workspace information forwarded untouched to every producer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalContext {
    pub scope_root: PathBuf,
    #[serde(default)]
    pub plan_path: Option<PathBuf>,
}

impl GlobalContext {
    pub fn new(scope_root: impl Into<PathBuf>, plan_path: Option<PathBuf>) -> Self {
        Self {
            scope_root: scope_root.into(),
            plan_path,
        }
    }

    /// Stable user id for a (scope_root, plan_path) pair.
    ///
    /// The same pair always yields the same id, so an editor that does not
    /// track identities still gets one cache per plan document.
    pub fn derive_user_id(&self) -> String {
        let plan = self
            .plan_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let combined = format!("{}:{}", self.scope_root.to_string_lossy(), plan);
        let hash = blake3::hash(combined.as_bytes()).to_hex();
        format!("user-{}", &hash.as_str()[..16])
    }
}
