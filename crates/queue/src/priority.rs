//! Weighted queue selection for the consumer.
//!
//! Each fetch starts from a "lead" queue chosen by a rotating slot counter.
//! A queue with weight `w` owns `w` of the `total_weight` slots, so over any
//! full rotation it leads exactly `w` times. Lower-weight queues are still
//! served on their own slots even while higher-weight queues have work: the
//! weights share scheduling slots, they do not preempt.

use crate::error::QueueError;

/// Queue names with their scheduling weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePriorities {
    /// Sorted by descending weight; ties keep configuration order.
    queues: Vec<(String, u32)>,
    /// Queue index owning each slot.
    slots: Vec<usize>,
}

impl QueuePriorities {
    pub fn new(queues: Vec<(String, u32)>) -> Result<Self, QueueError> {
        if queues.is_empty() {
            return Err(QueueError::Config("at least one queue is required".into()));
        }
        if let Some((name, _)) = queues.iter().find(|(_, weight)| *weight == 0) {
            return Err(QueueError::Config(format!(
                "queue '{}' must have a weight above zero",
                name
            )));
        }

        let mut queues = queues;
        queues.sort_by(|a, b| b.1.cmp(&a.1));

        let slots = queues
            .iter()
            .enumerate()
            .flat_map(|(index, (_, weight))| std::iter::repeat_n(index, *weight as usize))
            .collect();

        Ok(Self { queues, slots })
    }

    pub fn total_weight(&self) -> usize {
        self.slots.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(|(name, _)| name.as_str())
    }

    /// Every queue, lead queue for `tick` first, the rest by descending weight.
    pub fn order(&self, tick: usize) -> Vec<&str> {
        let lead = self.slots[tick % self.slots.len()];

        std::iter::once(lead)
            .chain((0..self.queues.len()).filter(|&i| i != lead))
            .map(|i| self.queues[i].0.as_str())
            .collect()
    }
}

impl Default for QueuePriorities {
    fn default() -> Self {
        Self {
            queues: vec![
                ("critical".to_string(), 6),
                ("default".to_string(), 3),
                ("low".to_string(), 1),
            ],
            slots: vec![0, 0, 0, 0, 0, 0, 1, 1, 1, 2],
        }
    }
}
