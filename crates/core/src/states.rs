use serde::{Deserialize, Serialize};

/// Collection progress of a single customer within a session.
///
/// The variants are ordered: a customer walks through them front to back and
/// the first unsatisfied field decides the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustomerState {
    CustomerName,
    FollowContent,
    FollowGoal,
    FollowResult,
    NextPlan,
    FollowMethod,
    Complete,
}

impl CustomerState {
    /// Canonical collection ordering, excluding `Complete`.
    pub const ORDER: [CustomerState; 6] = [
        CustomerState::CustomerName,
        CustomerState::FollowContent,
        CustomerState::FollowGoal,
        CustomerState::FollowResult,
        CustomerState::NextPlan,
        CustomerState::FollowMethod,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CustomerState::CustomerName => "CUSTOMER_NAME",
            CustomerState::FollowContent => "FOLLOW_CONTENT",
            CustomerState::FollowGoal => "FOLLOW_GOAL",
            CustomerState::FollowResult => "FOLLOW_RESULT",
            CustomerState::NextPlan => "NEXT_PLAN",
            CustomerState::FollowMethod => "FOLLOW_METHOD",
            CustomerState::Complete => "COMPLETE",
        }
    }

    pub fn parse(value: &str) -> Option<CustomerState> {
        match value {
            "CUSTOMER_NAME" => Some(CustomerState::CustomerName),
            "FOLLOW_CONTENT" => Some(CustomerState::FollowContent),
            "FOLLOW_GOAL" => Some(CustomerState::FollowGoal),
            "FOLLOW_RESULT" => Some(CustomerState::FollowResult),
            "NEXT_PLAN" => Some(CustomerState::NextPlan),
            "FOLLOW_METHOD" => Some(CustomerState::FollowMethod),
            "COMPLETE" => Some(CustomerState::Complete),
            _ => None,
        }
    }

    /// The record field a state is waiting on. `Complete` owns no field.
    pub fn expected_field(self) -> Option<&'static str> {
        match self {
            CustomerState::CustomerName => Some("customer_name"),
            CustomerState::FollowContent => Some("follow_content"),
            CustomerState::FollowGoal => Some("follow_goal"),
            CustomerState::FollowResult => Some("follow_result"),
            CustomerState::NextPlan => Some("next_plan"),
            CustomerState::FollowMethod => Some("follow_method"),
            CustomerState::Complete => None,
        }
    }

    /// Human description of the expected information, used in prompts.
    pub fn expected_info(self) -> &'static str {
        match self {
            CustomerState::CustomerName => "客户名称",
            CustomerState::FollowContent => "跟进事项/项目",
            CustomerState::FollowGoal => "跟进期望达到的目标",
            CustomerState::FollowResult => "跟进实际达到的结果",
            CustomerState::NextPlan => "跟进后下一步的计划",
            CustomerState::FollowMethod => "跟进方式（线上/线下）",
            CustomerState::Complete => "",
        }
    }
}

/// Stage of the session-level pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStage {
    Collecting,
    AskingOtherCustomers,
    Confirming,
    Outputting,
    Exit,
}

impl SessionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStage::Collecting => "COLLECTING",
            SessionStage::AskingOtherCustomers => "ASKING_OTHER_CUSTOMERS",
            SessionStage::Confirming => "CONFIRMING",
            SessionStage::Outputting => "OUTPUTTING",
            SessionStage::Exit => "EXIT",
        }
    }

    pub fn parse(value: &str) -> Option<SessionStage> {
        match value {
            "COLLECTING" => Some(SessionStage::Collecting),
            "ASKING_OTHER_CUSTOMERS" => Some(SessionStage::AskingOtherCustomers),
            "CONFIRMING" => Some(SessionStage::Confirming),
            "OUTPUTTING" => Some(SessionStage::Outputting),
            "EXIT" => Some(SessionStage::Exit),
            _ => None,
        }
    }

    /// Stages in which the orchestrator collects or confirms follow-up data.
    /// Extraction, focus recovery and the focus-pending invariant only apply
    /// here.
    pub fn is_collection_like(self) -> bool {
        matches!(
            self,
            SessionStage::Collecting | SessionStage::Confirming | SessionStage::AskingOtherCustomers
        )
    }
}

/// Verdict from semantic analysis: does the utterance carry follow-up
/// information at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SemanticRelevance {
    Strong,
    None,
}

impl SemanticRelevance {
    pub fn as_str(self) -> &'static str {
        match self {
            SemanticRelevance::Strong => "STRONG",
            SemanticRelevance::None => "NONE",
        }
    }
}

impl Default for SemanticRelevance {
    fn default() -> Self {
        SemanticRelevance::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_str() {
        for state in CustomerState::ORDER.iter().copied().chain([CustomerState::Complete]) {
            assert_eq!(CustomerState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CustomerState::parse("NOT_A_STATE"), None);
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in [
            SessionStage::Collecting,
            SessionStage::AskingOtherCustomers,
            SessionStage::Confirming,
            SessionStage::Outputting,
            SessionStage::Exit,
        ] {
            assert_eq!(SessionStage::parse(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn canonical_order_matches_variant_order() {
        let mut sorted = CustomerState::ORDER;
        sorted.sort();
        assert_eq!(sorted, CustomerState::ORDER);
        assert!(CustomerState::FollowMethod < CustomerState::Complete);
    }

    #[test]
    fn only_collection_like_stages_allow_extraction() {
        assert!(SessionStage::Collecting.is_collection_like());
        assert!(SessionStage::Confirming.is_collection_like());
        assert!(SessionStage::AskingOtherCustomers.is_collection_like());
        assert!(!SessionStage::Outputting.is_collection_like());
        assert!(!SessionStage::Exit.is_collection_like());
    }
}
