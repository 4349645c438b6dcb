//! End-to-end turn scenarios against a scripted provider and mock tools.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use nanobot_agent::context::ContextBuilder;
use nanobot_agent::policy::ToolPolicy;
use nanobot_agent::system_turn::SystemTurnService;
use nanobot_agent::tools::{Tool, ToolRegistry, ToolResult};
use nanobot_agent::turn_engine::{TurnEngine, TurnFlags, TurnLimits};
use nanobot_agent::user_turn::UserTurnService;
use nanobot_agent::ToolExecutor;
use nanobot_core::config::BrainConfig;
use nanobot_core::types::{ChatMessage, InboundMessage, Role};
use nanobot_core::AuditLog;
use nanobot_hooks::HookRegistry;
use nanobot_memory::MemoryStore;
use nanobot_providers::{
    ChatRequest, LLMResponse, LlmProvider, ModelRegistry, ProviderError, ProviderRouter,
    ToolCallRequest,
};
use nanobot_sessions::SessionStore;

/// Provider that replays a scripted list of responses.
struct ScriptedProvider {
    responses: Mutex<VecDeque<LLMResponse>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<LLMResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }
    fn api_base(&self) -> &str {
        "https://scripted.example/v1"
    }
    fn default_model(&self) -> &str {
        "test-model"
    }
    async fn chat(&self, _req: &ChatRequest) -> Result<LLMResponse, ProviderError> {
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| LLMResponse::text("（脚本耗尽）")))
    }
}

fn tool_call_response(id: &str, name: &str, arguments: Value) -> LLMResponse {
    LLMResponse {
        content: None,
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
        finish_reason: "tool_calls".to_string(),
    }
}

struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "List files in a directory"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]})
    }
    async fn execute(&self, params: Value) -> ToolResult {
        ToolResult::ok(format!(
            "{}: 3 entries",
            params["path"].as_str().unwrap_or(".")
        ))
    }
}

struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read the contents of a file"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}, "required": ["path"]})
    }
    async fn execute(&self, params: Value) -> ToolResult {
        ToolResult::fail(format!(
            "Error: file '{}' not found",
            params["path"].as_str().unwrap_or("?")
        ))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    executor: Arc<ToolExecutor>,
    engine: Arc<TurnEngine>,
    sessions: Arc<SessionStore>,
    user_turn: UserTurnService,
    system_turn: SystemTurnService,
}

fn harness(responses: Vec<LLMResponse>) -> Harness {
    harness_with_limits(
        responses,
        TurnLimits {
            max_iterations: 10,
            max_total_tool_calls: 30,
            max_turn_seconds: 45,
        },
    )
}

fn harness_with_limits(responses: Vec<LLMResponse>, limits: TurnLimits) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(ListDirTool));
    registry.register(Arc::new(ReadFileTool));

    let hooks = Arc::new(HookRegistry::new());
    let executor = Arc::new(ToolExecutor::new(registry.clone(), hooks.clone(), None));
    let router = Arc::new(ProviderRouter::new(
        Arc::new(ScriptedProvider::new(responses)),
        "test-model",
        Arc::new(ModelRegistry::new()),
        1024,
        0.7,
    ));
    let audit = AuditLog::new(dir.path().join("audit.log"));
    let engine = Arc::new(TurnEngine::new(
        router,
        executor.clone(),
        registry.clone(),
        ToolPolicy::default(),
        hooks,
        audit,
        "test-model",
        limits,
        "系统检测到你正在重复执行相同的工具调用且未取得进展。请改用其他思路。",
        "抱歉，我陷入了重复执行的循环并未能恢复。",
    ));

    let memory = Arc::new(MemoryStore::new(dir.path()));
    let context = Arc::new(ContextBuilder::new(
        dir.path(),
        "test-model",
        BrainConfig::default(),
        memory,
    ));
    let sessions = Arc::new(SessionStore::new(dir.path().join("sessions")));

    let user_turn = UserTurnService::new(
        sessions.clone(),
        context.clone(),
        registry.clone(),
        executor.clone(),
        engine.clone(),
        BrainConfig::default(),
    );
    let system_turn = SystemTurnService::new(
        sessions.clone(),
        context,
        registry.clone(),
        executor.clone(),
        engine.clone(),
        "cli",
    );

    Harness {
        _dir: dir,
        executor,
        engine,
        sessions,
        user_turn,
        system_turn,
    }
}

fn prompt_messages(content: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::system("test prompt"), ChatMessage::user(content)]
}

// Scenario: plain question and answer, no tools involved.
#[tokio::test]
async fn normal_qa_round_trip() {
    let h = harness(vec![LLMResponse::text("收到测试1")]);
    let msg = InboundMessage::new("cli", "user", "direct", "测试1：你好，请回复'收到测试1'");
    let out = h.user_turn.process(&msg).await.expect("reply expected");
    assert_eq!(out.channel, "cli");
    assert_eq!(out.chat_id, "direct");
    assert!(out.content.contains("收到测试1"));

    // The turn is persisted: user message then assistant message.
    let session = h.sessions.load("cli:direct").unwrap().unwrap();
    assert_eq!(session.messages.len(), 2);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[1].role, Role::Assistant);
}

// Scenario: one successful tool round, then a final answer.
#[tokio::test]
async fn tool_success_round() {
    let h = harness(vec![
        tool_call_response("call_1", "list_dir", json!({"path": "."})),
        LLMResponse::text("目录读取完成"),
    ]);
    let msg = InboundMessage::new("cli", "user", "direct", "看看当前目录");
    let out = h.user_turn.process(&msg).await.expect("reply expected");
    assert!(out.content.contains("完成"));
}

// Scenario: a failing tool lands in the failed set and the identical retry
// is intercepted.
#[tokio::test]
async fn tool_failure_recorded_and_intercepted() {
    let h = harness(vec![
        tool_call_response("call_1", "read_file", json!({"path": "no_such_file_abc.txt"})),
        LLMResponse::text("已收到失败结果并结束"),
    ]);

    let mut messages = prompt_messages("读取 no_such_file_abc.txt");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-fail"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("结束"));

    // The failed call is now hash-blocked.
    let args = json!({"path": "no_such_file_abc.txt"});
    assert!(h.executor.is_failed_call("read_file", &args));
    let second = h.executor.execute("read_file", args).await;
    assert!(!second.success);
    assert!(second.output.contains("Blocked"));

    // The tool message fed back to the model carried the failure text.
    let tool_msg = messages.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(tool_msg.text().unwrap().contains("not found"));
}

// Scenario: system message carrying an origin envelope routes the reply to
// the origin channel.
#[tokio::test]
async fn system_origin_routing() {
    let h = harness(vec![LLMResponse::text("后台任务完成")]);
    let mut msg = InboundMessage::new("system", "cron", "direct", "x");
    msg.metadata.insert(
        "origin".into(),
        json!({"channel": "telegram", "chat_id": "12345"}),
    );
    let out = h.system_turn.process(&msg).await.expect("reply expected");
    assert_eq!(out.channel, "telegram");
    assert_eq!(out.chat_id, "12345");

    // The session belongs to the origin, tagged with the system sender.
    let session = h.sessions.load("telegram:12345").unwrap().unwrap();
    assert!(session.messages[0]
        .text()
        .unwrap()
        .starts_with("[System: cron]"));
}

// Scenario: content claiming an unused tool is struck through and a
// correction is injected into the session.
#[tokio::test]
async fn truthfulness_audit_marks_unused_tool_claims() {
    let h = harness(vec![LLMResponse::text(
        "我刚才使用了 read_file 读取了配置文件。",
    )]);
    let msg = InboundMessage::new("cli", "user", "direct", "你做了什么？");
    let out = h.user_turn.process(&msg).await.expect("reply expected");
    assert!(out.content.contains("~~"));
    assert!(out.content.contains("[审计：记录中未见 read_file 相关操作]"));

    let session = h.sessions.load("cli:direct").unwrap().unwrap();
    assert!(session
        .messages
        .iter()
        .any(|m| m.role == Role::System
            && m.text().map(|t| t.contains("诚信审计")).unwrap_or(false)));
}

// Loop break: an identical batch proposed every iteration terminates with
// the loop-break reply once retries are exhausted.
#[tokio::test]
async fn strict_loop_breaks_with_loop_reply() {
    let same_batch =
        || tool_call_response("call_fixed", "list_dir", json!({"path": "."}));
    let h = harness_with_limits(
        vec![same_batch(), same_batch(), same_batch(), same_batch(), same_batch()],
        TurnLimits {
            max_iterations: 5,
            max_total_tool_calls: 30,
            max_turn_seconds: 45,
        },
    );
    let mut messages = prompt_messages("一直重复");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-loop"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("循环"));
}

// Loop correction: with retries remaining, the engine injects exactly one
// self-correction system message and then proceeds.
#[tokio::test]
async fn strict_loop_injects_one_self_correction() {
    let same_batch =
        || tool_call_response("call_fixed", "list_dir", json!({"path": "."}));
    let h = harness_with_limits(
        vec![
            same_batch(),
            same_batch(),
            same_batch(),
            same_batch(),
            LLMResponse::text("换了思路，已完成"),
        ],
        TurnLimits {
            max_iterations: 8,
            max_total_tool_calls: 30,
            max_turn_seconds: 45,
        },
    );
    let mut messages = prompt_messages("重复两次再恢复");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-correct"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("已完成"));

    let corrections = messages
        .iter()
        .filter(|m| {
            m.role == Role::System
                && m.text().map(|t| t.contains("重复执行")).unwrap_or(false)
        })
        .count();
    assert_eq!(corrections, 1);
}

// Budget: once the projection would exceed the cap, the engine emits a
// forced summary instead of the next batch.
#[tokio::test]
async fn tool_budget_forces_summary() {
    let batch = || LLMResponse {
        content: None,
        tool_calls: vec![
            ToolCallRequest {
                id: "call_a".into(),
                name: "list_dir".into(),
                arguments: json!({"path": "a"}),
            },
            ToolCallRequest {
                id: "call_b".into(),
                name: "list_dir".into(),
                arguments: json!({"path": "b"}),
            },
        ],
        finish_reason: "tool_calls".to_string(),
    };
    let h = harness_with_limits(
        vec![
            batch(),
            batch(),
            // This response answers the forced-summary request.
            LLMResponse::text("总结：目录检查到一半，预算已用完。"),
        ],
        TurnLimits {
            max_iterations: 10,
            max_total_tool_calls: 3,
            max_turn_seconds: 45,
        },
    );
    let mut messages = prompt_messages("遍历所有目录");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-budget"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("总结"));

    // Only the first batch (2 calls) ever executed.
    let executed = messages.iter().filter(|m| m.role == Role::Tool).count();
    assert_eq!(executed, 2);
}

// Parse-from-text: a fenced JSON tool call in plain text is recovered and
// executed when the flag is on.
#[tokio::test]
async fn tool_calls_parsed_from_text() {
    let h = harness(vec![
        LLMResponse::text(
            "我需要看一下目录：\n```json\n{\"name\": \"list_dir\", \"arguments\": {\"path\": \".\"}}\n```",
        ),
        LLMResponse::text("看完了"),
    ]);
    let mut messages = prompt_messages("看看目录");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-parse"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("看完了"));
    assert_eq!(
        h.engine.pop_used_tools(Some("trace-parse")),
        vec!["list_dir".to_string()]
    );
}

// Same input with the system-turn flags: the fenced call is NOT parsed.
#[tokio::test]
async fn system_turn_does_not_parse_text_calls() {
    let h = harness(vec![LLMResponse::text(
        "```json\n{\"name\": \"list_dir\", \"arguments\": {\"path\": \".\"}}\n```",
    )]);
    let mut messages = prompt_messages("后台任务");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-sys"), TurnFlags::system_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("list_dir"));
    assert!(h.engine.pop_used_tools(Some("trace-sys")).is_empty());
}

// Empty-reply safeguard: a blank final answer re-runs the forced summary.
#[tokio::test]
async fn empty_reply_triggers_forced_summary() {
    let h = harness(vec![
        LLMResponse::text(""),
        LLMResponse::text("补充回复"),
    ]);
    let mut messages = prompt_messages("你好");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-empty"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert_eq!(final_content, "补充回复");
}

// All tool calls failed: the user-visible reply is candid instead of
// success-sounding.
#[tokio::test]
async fn execution_truth_overrides_failed_turn() {
    let h = harness(vec![
        tool_call_response("call_1", "read_file", json!({"path": "ghost.txt"})),
        LLMResponse::text("任务已完成！"),
    ]);
    let msg = InboundMessage::new("cli", "user", "direct", "读取 ghost.txt");
    let out = h.user_turn.process(&msg).await.expect("reply expected");
    assert!(out.content.contains("均未成功执行"));
    assert!(!out.content.contains("任务已完成！"));
}

// Clarification guard: a weather ask where the model invents a city stops
// for confirmation instead of calling the tool.
#[tokio::test]
async fn clarification_guard_stops_invented_location() {
    let h = harness(vec![tool_call_response(
        "call_1",
        "list_dir",
        json!({"path": ".", "city": "上海"}),
    )]);
    let mut messages = prompt_messages("明天天气怎么样？");
    let final_content = h
        .engine
        .run(&mut messages, Some("trace-clarify"), TurnFlags::user_turn())
        .await
        .expect("content expected");
    assert!(final_content.contains("在继续之前需要你确认"));
    assert!(final_content.contains("上海"));

    // Nothing was executed.
    assert!(messages.iter().all(|m| m.role != Role::Tool));
}
