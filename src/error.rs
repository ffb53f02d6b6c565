//! 에러 타입
//!
//! 라이브러리 전반에서 사용하는 에러 열거형입니다.
//! 외부 모델(임베딩, 리랭커, 생성기) 호출은 `anyhow::Result`를 반환하고,
//! 엔진이 이를 아래 타입으로 변환합니다.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("index consistency error for chunk {chunk_id}: {reason}")]
    Consistency { chunk_id: u64, reason: String },

    #[error("corrupted index store at {path}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RagError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// 손상된 저장소 에러 여부
    ///
    /// 호출자는 이 경우를 "빈 코퍼스"와 구분해야 합니다.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_is_distinct() {
        let err = RagError::corrupted("/tmp/x", "bad checksum");
        assert!(err.is_corruption());
        assert!(err.to_string().contains("bad checksum"));

        let err = RagError::Config("w_semantic".to_string());
        assert!(!err.is_corruption());
    }

    #[test]
    fn test_dimension_mismatch_message() {
        let err = RagError::DimensionMismatch {
            expected: 768,
            actual: 384,
        };
        assert_eq!(
            err.to_string(),
            "embedding dimension mismatch: expected 768, got 384"
        );
    }
}
