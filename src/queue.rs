use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// FIFO of submission ids waiting for a grading worker.
pub struct GradingQueue {
    queue: Mutex<VecDeque<u32>>,
    notify: Notify,
}

impl GradingQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, submission_id: u32) {
        self.queue.lock().await.push_back(submission_id);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> u32 {
        loop {
            if let Some(submission_id) = self.queue.lock().await.pop_front() {
                return submission_id;
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

impl Default for GradingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_pops_in_submission_order() {
        let queue = GradingQueue::new();
        queue.push(3).await;
        queue.push(1).await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.pop().await, 3);
        assert_eq!(queue.pop().await, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(GradingQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(9).await;

        let popped = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped, 9);
    }
}
