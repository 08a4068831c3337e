//! In-memory item source.

use std::collections::VecDeque;

use async_trait::async_trait;

use super::{Entity, ItemSource};
use crate::error::SourceError;

/// Item source backed by a scripted sequence of results.
///
/// Each scripted step is yielded exactly once, so a transient error followed
/// by the same entity models a retry that succeeds.
#[derive(Debug, Default)]
pub struct MemorySource {
    steps: VecDeque<Result<Entity, SourceError>>,
    expected_total: Option<u64>,
}

impl MemorySource {
    /// Source that yields the given entities without errors.
    #[must_use]
    pub fn from_entities(entities: Vec<Entity>, expected_total: Option<u64>) -> Self {
        Self {
            steps: entities.into_iter().map(Ok).collect(),
            expected_total,
        }
    }

    /// Source that yields the given steps in order.
    #[must_use]
    pub fn scripted(steps: Vec<Result<Entity, SourceError>>, expected_total: Option<u64>) -> Self {
        Self {
            steps: steps.into(),
            expected_total,
        }
    }

    /// Steps not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

#[async_trait]
impl ItemSource for MemorySource {
    fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    async fn next_item(&mut self) -> Option<Result<Entity, SourceError>> {
        self.steps.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_yields_in_order_then_ends() {
        let mut source = MemorySource::scripted(
            vec![
                Ok(Entity::new("a", "A")),
                Err(SourceError::Connectivity("reset".into())),
                Ok(Entity::new("b", "B")),
            ],
            Some(2),
        );

        assert_eq!(source.expected_total(), Some(2));
        assert_eq!(source.next_item().await.unwrap().unwrap().id, "a");
        assert!(source.next_item().await.unwrap().is_err());
        assert_eq!(source.next_item().await.unwrap().unwrap().id, "b");
        assert!(source.next_item().await.is_none());
        assert_eq!(source.remaining(), 0);
    }
}
