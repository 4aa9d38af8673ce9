use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared boolean used for one-shot decisions across tasks.
#[derive(Clone)]
pub struct Flag(Arc<RwLock<bool>>);

impl Flag {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub async fn read(&self) -> bool {
        *self.0.read().await
    }

    /// One-shot set: returns true only for the single caller that flipped it.
    pub async fn raise(&self) -> bool {
        let mut guard = self.0.write().await;
        if *guard {
            false
        } else {
            *guard = true;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raise_flips_exactly_once() {
        let flag = Flag::new(false);
        assert!(flag.raise().await);
        assert!(!flag.raise().await);
        assert!(flag.read().await);
    }
}
