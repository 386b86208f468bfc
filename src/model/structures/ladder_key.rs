use super::{discipline::Discipline, sport::Sport};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Identity of a rating ladder.
///
/// Two matches share a rating state space exactly when their ladder keys are
/// equal. Segment and class codes are optional refinements used by
/// organizations that split their ladders (age bands, skill classes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LadderKey {
    pub sport: Sport,
    pub discipline: Discipline,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_codes: Vec<String>
}

impl LadderKey {
    pub fn new(sport: Sport, discipline: Discipline) -> Self {
        Self {
            sport,
            discipline,
            segment: None,
            class_codes: Vec::new()
        }
    }

    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    pub fn with_class_codes<I: IntoIterator<Item = String>>(mut self, codes: I) -> Self {
        self.class_codes = codes.into_iter().collect();
        self
    }

    /// Deterministic ladder id: lowercase `sport:discipline[:segment][:codes]`.
    ///
    /// Class codes are sorted before joining so the id does not depend on
    /// submission order.
    pub fn ladder_id(&self) -> String {
        let mut id = format!("{}:{}", self.sport, self.discipline).to_lowercase();
        if let Some(segment) = &self.segment {
            id.push(':');
            id.push_str(&segment.to_lowercase());
        }
        if !self.class_codes.is_empty() {
            let codes = self.class_codes.iter().map(|c| c.to_lowercase()).sorted().join("+");
            id.push(':');
            id.push_str(&codes);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_ladder_id() {
        let key = LadderKey::new(Sport::Tennis, Discipline::Singles);
        assert_eq!(key.ladder_id(), "tennis:singles");
    }

    #[test]
    fn test_segmented_ladder_id() {
        let key = LadderKey::new(Sport::Badminton, Discipline::Doubles)
            .with_segment("U19")
            .with_class_codes(vec!["B".to_string(), "A".to_string()]);
        assert_eq!(key.ladder_id(), "badminton:doubles:u19:a+b");
    }

    #[test]
    fn test_class_code_order_is_stable() {
        let a = LadderKey::new(Sport::Squash, Discipline::Singles)
            .with_class_codes(vec!["M1".to_string(), "M2".to_string()]);
        let b = LadderKey::new(Sport::Squash, Discipline::Singles)
            .with_class_codes(vec!["M2".to_string(), "M1".to_string()]);
        assert_eq!(a.ladder_id(), b.ladder_id());
    }
}
