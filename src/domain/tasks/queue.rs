//! Named priority queues and the weighted polling schedule.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::foundation::ValidationError;

/// One of the fixed priority classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Critical,
    Default,
    Low,
}

impl QueueName {
    /// Highest priority first.
    pub const ALL: [QueueName; 3] = [QueueName::Critical, QueueName::Default, QueueName::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Critical => "critical",
            QueueName::Default => "default",
            QueueName::Low => "low",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(QueueName::Critical),
            "default" => Ok(QueueName::Default),
            "low" => Ok(QueueName::Low),
            other => Err(ValidationError::invalid_format(
                "queue",
                format!("unknown queue '{}'", other),
            )),
        }
    }
}

/// Relative polling weights per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWeights {
    pub critical: u32,
    pub default: u32,
    pub low: u32,
}

impl QueueWeights {
    pub fn weight(&self, queue: QueueName) -> u32 {
        match queue {
            QueueName::Critical => self.critical,
            QueueName::Default => self.default,
            QueueName::Low => self.low,
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.default + self.low
    }
}

impl Default for QueueWeights {
    fn default() -> Self {
        Self {
            critical: 6,
            default: 3,
            low: 1,
        }
    }
}

/// Precomputed smooth weighted round-robin cycle.
///
/// With weights 6:3:1 one cycle has ten slots and each queue appears
/// exactly `weight` times, spread out rather than bunched.
#[derive(Debug, Clone)]
pub struct WeightedSchedule {
    slots: Vec<QueueName>,
}

impl WeightedSchedule {
    pub fn new(weights: QueueWeights) -> Self {
        let total = weights.total() as i64;
        let mut current = [0i64; 3];
        let mut slots = Vec::with_capacity(total as usize);

        for _ in 0..total {
            for (i, queue) in QueueName::ALL.iter().enumerate() {
                current[i] += weights.weight(*queue) as i64;
            }
            // ties resolve toward the higher priority queue
            let mut best = 0;
            for i in 1..current.len() {
                if current[i] > current[best] {
                    best = i;
                }
            }
            current[best] -= total;
            slots.push(QueueName::ALL[best]);
        }

        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Queue polling order for the given tick: the scheduled queue first,
    /// then the remaining queues by priority.
    pub fn order_for(&self, tick: usize) -> [QueueName; 3] {
        let first = if self.slots.is_empty() {
            QueueName::Critical
        } else {
            self.slots[tick % self.slots.len()]
        };

        let mut order = [first; 3];
        let mut idx = 1;
        for queue in QueueName::ALL {
            if queue != first {
                order[idx] = queue;
                idx += 1;
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_match_broker_layout() {
        let names: Vec<_> = QueueName::ALL.iter().map(|q| q.as_str()).collect();
        assert_eq!(names, vec!["critical", "default", "low"]);
    }

    #[test]
    fn schedule_respects_weights() {
        let schedule = WeightedSchedule::new(QueueWeights::default());
        assert_eq!(schedule.len(), 10);

        let count = |q: QueueName| (0..10).filter(|t| schedule.order_for(*t)[0] == q).count();
        assert_eq!(count(QueueName::Critical), 6);
        assert_eq!(count(QueueName::Default), 3);
        assert_eq!(count(QueueName::Low), 1);
    }

    #[test]
    fn schedule_spreads_critical_slots() {
        let schedule = WeightedSchedule::new(QueueWeights::default());
        let firsts: Vec<_> = (0..10).map(|t| schedule.order_for(t)[0]).collect();
        // no run of the same lower-priority queue back to back
        for pair in firsts.windows(2) {
            if pair[0] != QueueName::Critical {
                assert_ne!(pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn order_always_covers_every_queue() {
        let schedule = WeightedSchedule::new(QueueWeights::default());
        for tick in 0..20 {
            let mut order = schedule.order_for(tick).to_vec();
            order.sort();
            assert_eq!(order, QueueName::ALL.to_vec());
        }
    }

    #[test]
    fn unknown_queue_is_rejected() {
        assert!("urgent".parse::<QueueName>().is_err());
        assert_eq!("low".parse::<QueueName>().unwrap(), QueueName::Low);
    }
}
