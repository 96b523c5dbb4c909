use serde::{Deserialize, Serialize};

use txevents_events::Event;

/// Raised when a lottery has a winner. Consumers use it to send the prize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryConcluded {
    pub winner_id: i64,
}

impl Event for LotteryConcluded {
    fn event_type(&self) -> &'static str {
        "lottery.concluded"
    }

    fn version(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_is_stable() {
        let value = serde_json::to_value(LotteryConcluded { winner_id: 3 }).unwrap();
        assert_eq!(value, json!({ "winner_id": 3 }));
    }
}
