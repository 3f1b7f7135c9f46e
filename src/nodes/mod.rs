//! The built-in nodes and the three flows wired from them.

pub mod complaint;
pub mod extract;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use crate::flow::{Flow, FlowBuilder, FlowError};
use crate::gateway::Gateway;
use crate::node::outcome;
use crate::topics::TopicStore;

pub use complaint::{
    AwaitAnswerNode, DecideNode, GenerateFollowUpNode, ReceiveComplaintNode, RejectNode,
    SummarizeNode,
};
pub use extract::ExtractDataNode;

/// A long conversation takes four transitions per question round, so
/// the duplex flow gets more headroom than the engine default.
const CONVERSATION_STEP_LIMIT: usize = 128;

/// The interactive duplex flow: receive the complaint, then loop
/// question/answer/decide until the gateway judges the conversation
/// complete, then summarize.
pub fn complaint_flow(gateway: Arc<dyn Gateway>) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new();
    let receive = builder.node(Arc::new(ReceiveComplaintNode));
    let generate = builder.node(Arc::new(GenerateFollowUpNode::new(gateway.clone())));
    let await_answer = builder.node(Arc::new(AwaitAnswerNode));
    let decide = builder.node(Arc::new(DecideNode::new(gateway.clone())));
    let summarize = builder.node(Arc::new(SummarizeNode::new(gateway)));

    builder.start(receive);
    builder.edge(receive, outcome::DEFAULT, generate);
    builder.edge(generate, outcome::DEFAULT, await_answer);
    builder.edge(await_answer, outcome::DEFAULT, decide);
    builder.edge(decide, outcome::CONTINUE, generate);
    builder.edge(decide, outcome::COMPLETE, summarize);
    builder.step_limit(CONVERSATION_STEP_LIMIT);
    builder.build()
}

/// The task-queue flow: try to extract the structured fields from the
/// seeded conversation, then either ask one follow-up question or
/// summarize. One generated response per task execution.
pub fn triage_flow(
    gateway: Arc<dyn Gateway>,
    topics: Arc<dyn TopicStore>,
) -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new();
    let extract = builder.node(Arc::new(ExtractDataNode::new(gateway.clone(), topics)));
    let generate = builder.node(Arc::new(GenerateFollowUpNode::new(gateway.clone())));
    let summarize = builder.node(Arc::new(SummarizeNode::new(gateway)));

    builder.start(extract);
    builder.edge(extract, outcome::CONTINUE, generate);
    builder.edge(extract, outcome::END, summarize);
    builder.build()
}

/// Single fixed-response node for a task whose fields were already
/// complete on arrival.
pub fn reject_flow() -> Result<Flow, FlowError> {
    let mut builder = FlowBuilder::new();
    let reject = builder.node(Arc::new(RejectNode));
    builder.start(reject);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::ScriptedGateway;
    use crate::topics::StaticTopicStore;

    #[test]
    fn test_built_in_flows_construct() {
        let gateway = ScriptedGateway::new(vec![]);
        complaint_flow(gateway.clone()).unwrap();
        triage_flow(gateway, StaticTopicStore::with_defaults()).unwrap();
        reject_flow().unwrap();
    }
}
