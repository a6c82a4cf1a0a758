//! Template narration for the script stage.
//!
//! The first surviving segment opens with a greeting; later segments open
//! with a transition and never greet again. The last surviving segment of
//! a multi-segment run closes the lesson. Positions count survivors only,
//! so a segment lost to an earlier stage never shifts either line.

use async_trait::async_trait;
use sc_core::{CapabilityFailure, ContentUnit, DetailLevel, Stage};

use crate::capability::{Capability, CapabilityRequest, CapabilityResponse, InvokeContext};

#[derive(Debug, Clone)]
pub struct NarrationCapability {
    name: String,
}

impl NarrationCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Build the narration for `unit` at `position` of `total` segments.
    pub fn script(&self, unit: &ContentUnit, position: usize, total: usize, detail: DetailLevel) -> String {
        let title = unit.title.trim();
        let mut parts: Vec<String> = Vec::new();

        if position == 0 {
            parts.push(format!(
                "Welcome, everyone! Today, we're going to dive into {title}."
            ));
        } else {
            parts.push(format!("Now let's look at {title}."));
        }

        let points: Vec<&str> = unit
            .key_points
            .iter()
            .map(|p| p.trim().trim_end_matches(['.', '!', '?', ';', ':']))
            .filter(|p| !p.is_empty())
            .collect();

        match points.as_slice() {
            [] => {}
            [only] => parts.push(format!("{only}.")),
            [first, middle @ .., last] => {
                parts.push(format!("First, {first}."));
                for point in middle {
                    parts.push(format!("Next, {point}."));
                }
                parts.push(format!("Finally, {last}."));
            }
        }

        if detail == DetailLevel::Intelligent && points.len() > 1 {
            parts.push(format!(
                "Taken together, these {} ideas explain how {title} fits into the bigger picture.",
                points.len()
            ));
        }

        if total > 1 && position + 1 == total {
            parts.push(
                "And that wraps up our lesson for today. Thanks for watching!".to_string(),
            );
        }

        parts.join(" ")
    }
}

#[async_trait]
impl Capability for NarrationCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::GenerateScript
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        _ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        match request {
            CapabilityRequest::Script {
                unit,
                position,
                total,
                detail,
                ..
            } => Ok(CapabilityResponse::Script(
                self.script(&unit, position, total, detail),
            )),
            other => Err(CapabilityFailure::permanent(format!(
                "narration cannot serve {}",
                other.stage()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(title: &str, points: &[&str]) -> ContentUnit {
        ContentUnit {
            title: title.into(),
            key_points: points.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn first_segment_greets() {
        let script = NarrationCapability::new("narration").script(
            &unit("DNS", &["Names map to numbers.", "Caches speed it up"]),
            0,
            3,
            DetailLevel::Standard,
        );
        assert!(script.starts_with("Welcome, everyone!"));
        assert!(script.contains("First, Names map to numbers."));
        assert!(script.contains("Finally, Caches speed it up."));
        assert!(!script.contains("wraps up"));
    }

    #[test]
    fn later_segments_never_greet() {
        let script = NarrationCapability::new("narration").script(
            &unit("Resolvers", &["a", "b", "c"]),
            1,
            3,
            DetailLevel::Standard,
        );
        assert!(script.starts_with("Now let's look at Resolvers."));
        assert!(!script.contains("Welcome"));
        assert!(script.contains("Next, b."));
    }

    #[test]
    fn last_segment_closes() {
        let script = NarrationCapability::new("narration").script(
            &unit("Summary", &["done"]),
            2,
            3,
            DetailLevel::Standard,
        );
        assert!(script.ends_with("Thanks for watching!"));
        assert!(script.contains(" done."));
    }

    #[test]
    fn intelligent_detail_adds_synthesis() {
        let cap = NarrationCapability::new("narration");
        let u = unit("Caching", &["x", "y"]);
        let standard = cap.script(&u, 1, 4, DetailLevel::Standard);
        let deep = cap.script(&u, 1, 4, DetailLevel::Intelligent);
        assert!(deep.len() > standard.len());
        assert!(deep.contains("these 2 ideas"));
    }

    #[tokio::test]
    async fn greeting_and_closing_follow_position_not_index() {
        let ctx = InvokeContext::new(std::env::temp_dir(), std::time::Duration::from_secs(1));
        let cap = NarrationCapability::new("narration");
        let request = |index: u32, position: usize| CapabilityRequest::Script {
            unit: unit("Records", &["A and AAAA"]),
            index,
            position,
            total: 2,
            detail: DetailLevel::Standard,
        };

        // Segment 0 was lost earlier; segment 2 now opens the lesson.
        let opening = cap.invoke(request(2, 0), &ctx).await.unwrap();
        assert_matches::assert_matches!(opening, CapabilityResponse::Script(s) => {
            assert!(s.starts_with("Welcome, everyone!"));
            assert!(!s.contains("wraps up"));
        });

        let closing = cap.invoke(request(3, 1), &ctx).await.unwrap();
        assert_matches::assert_matches!(closing, CapabilityResponse::Script(s) => {
            assert!(s.starts_with("Now let's look at Records."));
            assert!(s.ends_with("Thanks for watching!"));
        });
    }

    #[tokio::test]
    async fn wrong_request_is_permanent() {
        let ctx = InvokeContext::new(std::env::temp_dir(), std::time::Duration::from_secs(1));
        let err = NarrationCapability::new("narration")
            .invoke(
                CapabilityRequest::Speech {
                    script: "x".into(),
                    voice: None,
                    index: 0,
                },
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
