//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Classification assigned to a Wikipedia article upstream of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleType {
    Person,
    Place,
    Organization,
    Event,
    Work,
    Concept,
    Other,
}

impl ArticleType {
    pub const ALL: [ArticleType; 7] = [
        ArticleType::Person,
        ArticleType::Place,
        ArticleType::Organization,
        ArticleType::Event,
        ArticleType::Work,
        ArticleType::Concept,
        ArticleType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArticleType::Person => "person",
            ArticleType::Place => "place",
            ArticleType::Organization => "organization",
            ArticleType::Event => "event",
            ArticleType::Work => "work",
            ArticleType::Concept => "concept",
            ArticleType::Other => "other",
        }
    }
}

impl fmt::Display for ArticleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArticleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArticleType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown article type: {}", s))
    }
}

/// Embedding model that produced a vector.
///
/// Every partition file holds vectors from exactly one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmbeddingModel {
    #[serde(rename = "minilm")]
    MiniLm,
    #[serde(rename = "bge-small")]
    BgeSmall,
    #[serde(rename = "bge-base")]
    BgeBase,
    #[serde(rename = "e5-base")]
    E5Base,
    #[serde(rename = "nomic")]
    Nomic,
    #[serde(rename = "openai-small")]
    OpenAiSmall,
}

impl EmbeddingModel {
    pub const ALL: [EmbeddingModel; 6] = [
        EmbeddingModel::MiniLm,
        EmbeddingModel::BgeSmall,
        EmbeddingModel::BgeBase,
        EmbeddingModel::E5Base,
        EmbeddingModel::Nomic,
        EmbeddingModel::OpenAiSmall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingModel::MiniLm => "minilm",
            EmbeddingModel::BgeSmall => "bge-small",
            EmbeddingModel::BgeBase => "bge-base",
            EmbeddingModel::E5Base => "e5-base",
            EmbeddingModel::Nomic => "nomic",
            EmbeddingModel::OpenAiSmall => "openai-small",
        }
    }

    /// Output width the model is published with.
    ///
    /// Informational only: the store pins the dimension per partition from
    /// the data it actually receives.
    pub fn native_dimension(self) -> usize {
        match self {
            EmbeddingModel::MiniLm | EmbeddingModel::BgeSmall => 384,
            EmbeddingModel::BgeBase | EmbeddingModel::E5Base | EmbeddingModel::Nomic => 768,
            EmbeddingModel::OpenAiSmall => 1536,
        }
    }
}

impl fmt::Display for EmbeddingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmbeddingModel::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("Unknown embedding model: {}", s))
    }
}

/// One embedded chunk of an article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    /// Unique within a partition; later writes with the same id replace earlier ones.
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub article_type: ArticleType,
    pub chunk_index: i32,
    pub text_preview: String,
    pub embedding: Vec<f32>,
    pub model: EmbeddingModel,
    /// Timestamp string as supplied by the embedding service.
    pub created_at: String,
}

impl EmbeddingRecord {
    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_string_forms_roundtrip() {
        for t in ArticleType::ALL {
            assert_eq!(t.as_str().parse::<ArticleType>().unwrap(), t);
        }
        for m in EmbeddingModel::ALL {
            assert_eq!(m.as_str().parse::<EmbeddingModel>().unwrap(), m);
        }
        assert!("novel".parse::<ArticleType>().is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let json = r#"{
            "id": "Ada_Lovelace#0",
            "title": "Ada Lovelace",
            "type": "person",
            "chunk_index": 0,
            "text_preview": "Augusta Ada King...",
            "embedding": [0.25, -0.5],
            "model": "bge-small",
            "created_at": "2024-03-01T12:00:00Z"
        }"#;

        let record: EmbeddingRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.article_type, ArticleType::Person);
        assert_eq!(record.model, EmbeddingModel::BgeSmall);
        assert_eq!(record.dimension(), 2);

        // serde and Display agree on the model name
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["model"], EmbeddingModel::BgeSmall.to_string());
    }
}
