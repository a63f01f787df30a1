// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end scheduler scenarios against mock model providers.
///
/// Every test is deterministic and needs no network access: scripted mocks
/// serve single-task flows, and the rule-routed mock serves fan-out flows
/// where several tasks share one provider concurrently.
#[cfg(test)]
mod scheduler_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use norn_model::{
        AssistantReply, CompletionRequest, MatchType, MessageContent, MockRules, Message,
        ModelProvider, ResponseRule, RoutedMockProvider, Role, ScriptedMockProvider,
        ScriptedReply, ToolCallRequest,
    };
    use norn_tools::{Tool, ToolOutput, ToolRegistry};

    use crate::{Scheduler, Task, TaskId, TaskPayload, TaskSnapshot, TaskStatus, TaskType};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn start_scheduler(model: Arc<dyn ModelProvider>, cap: usize) -> Scheduler {
        let scheduler = Scheduler::new(model, Arc::new(ToolRegistry::with_builtins()), cap);
        scheduler.start();
        scheduler
    }

    async fn wait(s: &Scheduler, id: TaskId) -> TaskSnapshot {
        tokio::time::timeout(Duration::from_secs(5), s.wait_until_terminal(id))
            .await
            .expect("task did not settle in time")
            .expect("task unknown to the scheduler")
    }

    fn subtask_by_name(s: &Scheduler, root: &TaskSnapshot, name: &str) -> TaskSnapshot {
        root.subtasks
            .iter()
            .filter_map(|id| s.get_task(*id))
            .find(|t| t.name == name)
            .unwrap_or_else(|| panic!("no subtask named {name:?}"))
    }

    fn rule_reply(match_type: MatchType, pattern: &str, reply: &str) -> ResponseRule {
        ResponseRule {
            match_type,
            pattern: pattern.into(),
            reply: Some(reply.into()),
            tool_calls: vec![],
            after_tool_reply: None,
            transport_error: None,
        }
    }

    fn rule_tool_call(
        pattern: &str,
        id: &str,
        tool: &str,
        args: serde_json::Value,
        after: &str,
    ) -> ResponseRule {
        ResponseRule {
            match_type: MatchType::Contains,
            pattern: pattern.into(),
            reply: None,
            tool_calls: vec![norn_model::ToolCallDef {
                id: id.into(),
                tool: tool.into(),
                args,
            }],
            after_tool_reply: Some(after.into()),
            transport_error: None,
        }
    }

    fn rule_transport_error(pattern: &str, error: &str) -> ResponseRule {
        ResponseRule {
            match_type: MatchType::Contains,
            pattern: pattern.into(),
            reply: None,
            tool_calls: vec![],
            after_tool_reply: None,
            transport_error: Some(error.into()),
        }
    }

    /// Wraps a provider and records the high-water mark of concurrent
    /// completion calls; each call is held briefly so overlap is observable.
    struct ProbeProvider<P> {
        inner: P,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        hold: Duration,
    }

    impl<P> ProbeProvider<P> {
        fn new(inner: P, hold: Duration) -> (Self, Arc<AtomicUsize>) {
            let max = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    inner,
                    in_flight: Arc::new(AtomicUsize::new(0)),
                    max_in_flight: Arc::clone(&max),
                    hold,
                },
                max,
            )
        }
    }

    #[async_trait]
    impl<P: ModelProvider> ModelProvider for ProbeProvider<P> {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
        async fn complete(&self, req: CompletionRequest) -> anyhow::Result<AssistantReply> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            let result = self.inner.complete(req).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    /// A tool that blocks far longer than any test runs.
    struct BlockingTool;

    #[async_trait]
    impl Tool for BlockingTool {
        fn name(&self) -> &str {
            "block_forever"
        }
        fn description(&self) -> &str {
            "blocks until cancelled"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &norn_tools::ToolCall) -> ToolOutput {
            tokio::time::sleep(Duration::from_secs(600)).await;
            ToolOutput::ok(&call.id, "unreachable")
        }
    }

    // ── Scenario 1: trivial leaf ──────────────────────────────────────────────

    #[tokio::test]
    async fn trivial_leaf_completes_with_one_model_call() {
        let model = Arc::new(ScriptedMockProvider::always_text("hi"));
        let log = model.request_log();
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new("say-hi", TaskPayload::prompt("say hi"), TaskType::Reasoning))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Completed);
        assert_eq!(snap.result.as_deref(), Some("hi"));
        assert_eq!(log.lock().unwrap().len(), 1, "exactly one model call");

        let stats = scheduler.stats();
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn messages_payload_is_sent_verbatim() {
        let model = Arc::new(ScriptedMockProvider::always_text("ok"));
        let log = model.request_log();
        let scheduler = start_scheduler(model, 5);

        let payload = TaskPayload::Messages {
            messages: vec![Message::system("be terse"), Message::user("go")],
        };
        let id = scheduler
            .submit(Task::new("verbatim", payload, TaskType::Reasoning))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Completed);
        let reqs = log.lock().unwrap();
        assert_eq!(reqs[0].messages.len(), 2);
        assert_eq!(reqs[0].messages[0].role, Role::System);
        scheduler.shutdown().await;
    }

    // ── Scenario 2: single tool round-trip ────────────────────────────────────

    #[tokio::test]
    async fn single_tool_round_trip() {
        let model = RoutedMockProvider::new(MockRules {
            responses: vec![rule_tool_call(
                "weather in boston",
                "w1",
                "get_current_weather",
                json!({ "location": "Boston" }),
                "30°C in Boston.",
            )],
        });
        let scheduler = start_scheduler(Arc::new(model), 5);

        let id = scheduler
            .submit(Task::new(
                "boston-weather",
                TaskPayload::prompt("weather in Boston?"),
                TaskType::Reasoning,
            ))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Completed);
        assert_eq!(snap.result.as_deref(), Some("30°C in Boston."));
        assert!(snap.started_at.is_some());
        assert!(snap.completed_at.is_some());

        let stats = scheduler.stats();
        assert_eq!(stats.running_tasks, 0, "semaphore slot returned");
        assert_eq!(stats.resumption_queue_size, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn tool_error_is_recovered_in_conversation() {
        // Round 1 calls a tool that does not exist; the dispatcher captures
        // the error into the tool-result message and the model recovers.
        let model = Arc::new(ScriptedMockProvider::new(vec![
            ScriptedReply::tool_call("x1", "nonexistent_tool", "{}"),
            ScriptedReply::text("recovered"),
        ]));
        let log = model.request_log();
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new("flaky", TaskPayload::prompt("try a tool"), TaskType::Reasoning))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Completed, "tool error must not fail the task");
        assert_eq!(snap.result.as_deref(), Some("recovered"));

        // The second model call saw a tool-result message carrying the error.
        let reqs = log.lock().unwrap();
        assert_eq!(reqs.len(), 2);
        let tool_msg = reqs[1]
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .expect("resumed conversation carries the tool result");
        match &tool_msg.content {
            MessageContent::ToolResult { tool_call_id, content, .. } => {
                assert_eq!(tool_call_id, "x1");
                assert!(content.contains("error"));
                assert!(content.contains("unknown tool"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        scheduler.shutdown().await;
    }

    // ── Scenario 3: plan with fan-out ─────────────────────────────────────────

    const TRIP_GOAL: &str = "Plan a 3-day Guangzhou trip";

    const TRIP_PLAN: &str = r#"{
        "subtasks": [
            {"name": "get_weather", "task_type": "tool_call",
             "payload": {"tool_name": "get_current_weather", "parameters": {"location": "Guangzhou"}},
             "dependencies": []},
            {"name": "find_food", "task_type": "tool_call",
             "payload": {"tool_name": "find_places", "parameters": {"keyword": "美食", "city": "广州"}},
             "dependencies": []},
            {"name": "summarise", "task_type": "final_summary",
             "payload": {"prompt": ""},
             "dependencies": ["get_weather"]}
        ]
    }"#;

    fn trip_rules() -> MockRules {
        MockRules {
            responses: vec![
                rule_reply(MatchType::Equals, TRIP_GOAL, TRIP_PLAN),
                rule_tool_call(
                    "`get_current_weather`",
                    "w1",
                    "get_current_weather",
                    json!({ "location": "Guangzhou" }),
                    "Guangzhou is 28C and humid.",
                ),
                rule_tool_call(
                    "`find_places`",
                    "f1",
                    "find_places",
                    json!({ "keyword": "美食", "city": "广州" }),
                    "Found three food spots.",
                ),
                rule_reply(
                    MatchType::Contains,
                    "synthesise the final answer",
                    "Your Guangzhou trip: warm days, great food.",
                ),
            ],
        }
    }

    #[tokio::test]
    async fn planning_fans_out_and_summary_carries_the_root_result() {
        let (model, max_in_flight) =
            ProbeProvider::new(RoutedMockProvider::new(trip_rules()), Duration::from_millis(40));
        let scheduler = start_scheduler(Arc::new(model), 5);

        let root_id = scheduler
            .submit(Task::new("trip", TaskPayload::prompt(TRIP_GOAL), TaskType::Planning))
            .unwrap();
        let root = wait(&scheduler, root_id).await;

        assert_eq!(root.status, TaskStatus::Completed);
        assert_eq!(
            root.result.as_deref(),
            Some("Your Guangzhou trip: warm days, great food."),
            "root result is the summary subtask's result"
        );
        assert_eq!(root.subtasks.len(), 3);

        let weather = subtask_by_name(&scheduler, &root, "get_weather");
        let food = subtask_by_name(&scheduler, &root, "find_food");
        let summary = subtask_by_name(&scheduler, &root, "summarise");

        assert_eq!(weather.status, TaskStatus::Completed);
        assert_eq!(food.status, TaskStatus::Completed);
        assert_eq!(summary.status, TaskStatus::Completed);

        // The implicit edge find_food → summarise was added by the planner.
        assert_eq!(summary.dependencies.len(), 2);

        // The summary prompt was rewritten at admission with the dependency
        // results, JSON-encoded.
        let prompt = summary.payload.goal().expect("summary payload is a prompt");
        assert!(prompt.contains(TRIP_GOAL));
        assert!(prompt.contains("- Result from get_weather:"));
        assert!(prompt.contains("Guangzhou is 28C and humid."));
        assert!(prompt.contains("- Result from find_food:"));

        // Dependency happens-before and parent-after-children.
        for dep in [&weather, &food] {
            assert!(
                dep.completed_at.unwrap() <= summary.started_at.unwrap(),
                "{} must complete before the summary starts",
                dep.name
            );
            assert!(dep.completed_at.unwrap() <= root.completed_at.unwrap());
        }

        // The two independent tool tasks overlapped.
        assert!(
            max_in_flight.load(Ordering::SeqCst) >= 2,
            "independent subtasks must run concurrently"
        );
        scheduler.shutdown().await;
    }

    // ── Scenario 4: dependency failure propagation ────────────────────────────

    #[tokio::test]
    async fn failed_dependency_propagates_without_sibling_kill() {
        let plan = r#"{
            "subtasks": [
                {"name": "get_weather", "task_type": "tool_call",
                 "payload": {"tool_name": "get_current_weather", "parameters": {"location": "Guangzhou"}},
                 "dependencies": []},
                {"name": "find_food", "task_type": "tool_call",
                 "payload": {"tool_name": "find_places", "parameters": {"keyword": "美食", "city": "广州"}},
                 "dependencies": []},
                {"name": "summarise", "task_type": "final_summary",
                 "payload": {"prompt": ""},
                 "dependencies": ["get_weather", "find_food"]}
            ]
        }"#;
        let model = RoutedMockProvider::new(MockRules {
            responses: vec![
                rule_reply(MatchType::Equals, TRIP_GOAL, plan),
                rule_transport_error("`get_current_weather`", "upstream returned 500"),
                rule_tool_call(
                    "`find_places`",
                    "f1",
                    "find_places",
                    json!({ "keyword": "美食", "city": "广州" }),
                    "Found three food spots.",
                ),
            ],
        });
        let scheduler = start_scheduler(Arc::new(model), 5);

        let root_id = scheduler
            .submit(Task::new("trip", TaskPayload::prompt(TRIP_GOAL), TaskType::Planning))
            .unwrap();
        let root = wait(&scheduler, root_id).await;

        assert_eq!(root.status, TaskStatus::Failed);
        assert!(root.result.as_deref().unwrap().contains("failed"));

        let weather = subtask_by_name(&scheduler, &root, "get_weather");
        assert_eq!(weather.status, TaskStatus::Failed);
        assert!(weather.result.as_deref().unwrap().contains("model call failed"));

        // The summary was never admitted: queued → failed with a propagated
        // error naming the failed dependency.
        let summary = subtask_by_name(&scheduler, &root, "summarise");
        assert_eq!(summary.status, TaskStatus::Failed);
        assert!(summary.started_at.is_none(), "failed dependents are never admitted");
        assert!(summary
            .result
            .as_deref()
            .unwrap()
            .contains("dependency 'get_weather' failed"));

        // No sibling-kills-sibling: the independent branch still completed.
        let food = subtask_by_name(&scheduler, &root, "find_food");
        assert_eq!(food.status, TaskStatus::Completed);
        scheduler.shutdown().await;
    }

    // ── Scenario 5: invalid plan ──────────────────────────────────────────────

    #[tokio::test]
    async fn plan_without_summary_fails_without_subtasks() {
        let plan = r#"{
            "subtasks": [
                {"name": "get_weather", "task_type": "tool_call",
                 "payload": {"tool_name": "get_current_weather", "parameters": {"location": "Guangzhou"}},
                 "dependencies": []}
            ]
        }"#;
        let model = RoutedMockProvider::new(MockRules {
            responses: vec![rule_reply(MatchType::Equals, TRIP_GOAL, plan)],
        });
        let scheduler = start_scheduler(Arc::new(model), 5);

        let root_id = scheduler
            .submit(Task::new("trip", TaskPayload::prompt(TRIP_GOAL), TaskType::Planning))
            .unwrap();
        let root = wait(&scheduler, root_id).await;

        assert_eq!(root.status, TaskStatus::Failed);
        assert!(root.result.as_deref().unwrap().contains("final_summary"));
        assert!(root.subtasks.is_empty(), "a rejected plan creates no subtasks");
        assert_eq!(scheduler.stats().total_known_tasks, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn cyclic_plan_fails_without_subtasks() {
        let plan = r#"{
            "subtasks": [
                {"name": "a", "task_type": "tool_call",
                 "payload": {"tool_name": "t", "parameters": {}}, "dependencies": ["b"]},
                {"name": "b", "task_type": "tool_call",
                 "payload": {"tool_name": "t", "parameters": {}}, "dependencies": ["a"]},
                {"name": "summarise", "task_type": "final_summary",
                 "payload": {"prompt": ""}, "dependencies": []}
            ]
        }"#;
        let model = RoutedMockProvider::new(MockRules {
            responses: vec![rule_reply(MatchType::Equals, TRIP_GOAL, plan)],
        });
        let scheduler = start_scheduler(Arc::new(model), 5);

        let root_id = scheduler
            .submit(Task::new("trip", TaskPayload::prompt(TRIP_GOAL), TaskType::Planning))
            .unwrap();
        let root = wait(&scheduler, root_id).await;

        assert_eq!(root.status, TaskStatus::Failed);
        assert!(root.result.as_deref().unwrap().contains("cycle"));
        assert_eq!(scheduler.stats().total_known_tasks, 1);
        scheduler.shutdown().await;
    }

    // ── Scenario 6: shutdown mid-flight ───────────────────────────────────────

    #[tokio::test]
    async fn shutdown_preempts_task_blocked_on_tool_dispatch() {
        let model = Arc::new(ScriptedMockProvider::new(vec![ScriptedReply::tool_call(
            "b1",
            "block_forever",
            "{}",
        )]));
        let mut registry = ToolRegistry::with_builtins();
        registry.register(BlockingTool);
        let scheduler = Scheduler::new(model, Arc::new(registry), 5);
        scheduler.start();

        let id = scheduler
            .submit(Task::new("stuck", TaskPayload::prompt("block now"), TaskType::Reasoning))
            .unwrap();

        // Wait until the task has suspended on the blocked dispatch.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let status = scheduler.get_task(id).unwrap().status;
            if status == TaskStatus::WaitingForTool {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task never suspended");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
            .await
            .expect("shutdown must complete within a bounded delay");

        let snap = scheduler.get_task(id).unwrap();
        assert_eq!(snap.status, TaskStatus::Preempted);
        assert_eq!(scheduler.stats().running_tasks, 0, "no semaphore slots remain held");
    }

    // ── Error-handling details ────────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_leaf_payload_fails_on_admission() {
        let model = Arc::new(ScriptedMockProvider::always_text("never used"));
        let log = model.request_log();
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new(
                "bad",
                TaskPayload::Other(json!({ "bogus": true })),
                TaskType::Reasoning,
            ))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.result.as_deref().unwrap().contains("invalid payload"));
        assert!(log.lock().unwrap().is_empty(), "no model call for an invalid payload");
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn planning_task_without_goal_fails() {
        let model = Arc::new(ScriptedMockProvider::always_text("never used"));
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new(
                "no-goal",
                TaskPayload::Other(json!({ "x": 1 })),
                TaskType::Planning,
            ))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(snap.result.as_deref().unwrap().contains("prompt"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn transport_error_fails_the_leaf_with_the_message() {
        let model = Arc::new(ScriptedMockProvider::new(vec![ScriptedReply::error(
            "rate limited",
        )]));
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new("leaf", TaskPayload::prompt("hello"), TaskType::Reasoning))
            .unwrap();
        let snap = wait(&scheduler, id).await;

        assert_eq!(snap.status, TaskStatus::Failed);
        let result = snap.result.as_deref().unwrap();
        assert!(result.contains("model call failed"));
        assert!(result.contains("rate limited"));
        assert_eq!(scheduler.stats().failed_tasks, 1);
        scheduler.shutdown().await;
    }

    // ── Terminality ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn terminal_status_and_result_never_change() {
        let model = Arc::new(ScriptedMockProvider::always_text("first"));
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new("t", TaskPayload::prompt("x"), TaskType::Reasoning))
            .unwrap();
        let first = wait(&scheduler, id).await;

        // Observe repeatedly; nothing may change after the terminal
        // transition, including across shutdown.
        let second = scheduler.get_task(id).unwrap();
        assert_eq!(first.status, second.status);
        assert_eq!(first.result, second.result);
        assert_eq!(first.completed_at, second.completed_at);

        scheduler.shutdown().await;
        let third = scheduler.get_task(id).unwrap();
        assert_eq!(first.status, third.status);
        assert_eq!(first.result, third.result);
    }

    // ── Concurrency cap ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn concurrency_never_exceeds_the_cap() {
        // Ten independent leaves through a cap of 2; the probe records the
        // high-water mark of concurrent model calls.
        let rules = MockRules {
            responses: vec![rule_reply(MatchType::Default, "", "done")],
        };
        let (model, max_in_flight) =
            ProbeProvider::new(RoutedMockProvider::new(rules), Duration::from_millis(10));
        let scheduler = start_scheduler(Arc::new(model), 2);

        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(
                scheduler
                    .submit(Task::new(
                        format!("leaf-{i}"),
                        TaskPayload::prompt(format!("job {i}")),
                        TaskType::Reasoning,
                    ))
                    .unwrap(),
            );
        }
        for id in ids {
            let snap = wait(&scheduler, id).await;
            assert_eq!(snap.status, TaskStatus::Completed);
        }

        let max = max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 2, "concurrency bound violated: {max} > 2");
        assert!(max >= 2, "cap was never saturated: {max}");
        assert_eq!(scheduler.stats().completed_tasks, 10);
        scheduler.shutdown().await;
    }

    // ── Tool-batch ordering ───────────────────────────────────────────────────

    #[tokio::test]
    async fn parallel_tool_results_return_in_request_order() {
        let model = Arc::new(ScriptedMockProvider::new(vec![
            ScriptedReply::tool_calls(vec![
                ToolCallRequest::new("c1", "get_current_weather", r#"{"location":"Boston"}"#),
                ToolCallRequest::new("c2", "arxiv_search", r#"{"query":"agents"}"#),
                ToolCallRequest::new(
                    "c3",
                    "find_places",
                    r#"{"keyword":"food","city":"Boston"}"#,
                ),
            ]),
            ScriptedReply::text("combined"),
        ]));
        let log = model.request_log();
        let scheduler = start_scheduler(model, 5);

        let id = scheduler
            .submit(Task::new("multi", TaskPayload::prompt("gather"), TaskType::Reasoning))
            .unwrap();
        let snap = wait(&scheduler, id).await;
        assert_eq!(snap.status, TaskStatus::Completed);

        let reqs = log.lock().unwrap();
        let tool_ids: Vec<String> = reqs[1]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id().map(str::to_string))
            .collect();
        assert_eq!(tool_ids, vec!["c1", "c2", "c3"], "results must be in request order");
        scheduler.shutdown().await;
    }
}
