use std::sync::Arc;

use secrecy::Secret;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use xinyi::server::content::ContentCatalog;
use xinyi::server::models::chat::{Phase, SessionStatus, User};
use xinyi::server::services::{
    chat_database::ChatDatabaseService,
    coordinator::{ChatCoordinator, ChatEvent},
    model_router::ModelRouter,
    modelscope::ModelScopeService,
    ollama::OllamaService,
    perception::PerceptionService,
    phase::PhaseManager,
};

async fn setup_test_db() -> Arc<ChatDatabaseService> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory database");
    let db = Arc::new(ChatDatabaseService::new(pool));
    db.migrate().await.expect("Failed to run migrations");
    db
}

fn build_coordinator(
    db: Arc<ChatDatabaseService>,
    ollama_url: &str,
    modelscope_url: &str,
) -> ChatCoordinator {
    let catalog = Arc::new(ContentCatalog::default());
    let local = Arc::new(OllamaService::new(ollama_url, "test-local"));
    let classifier = Arc::new(OllamaService::new(ollama_url, "test-classifier"));
    let remote = Arc::new(ModelScopeService::new(
        Secret::new("test-key".to_string()),
        modelscope_url,
        "test-remote",
    ));
    let perception = Arc::new(
        PerceptionService::new(classifier, catalog.clone()).expect("Failed to build perception"),
    );
    let phases = PhaseManager::new(catalog.solution_triggers.clone());
    let router = ModelRouter::new(local, remote);

    ChatCoordinator::new(db, perception, phases, router, catalog)
}

async fn run_turn(
    coordinator: &ChatCoordinator,
    user: &User,
    message: &str,
    session_id: Option<Uuid>,
) -> Vec<ChatEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    coordinator
        .process_turn(user, message, session_id, &tx)
        .await
        .expect("turn failed");
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn classifier_answer(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "message": { "role": "assistant", "content": content },
        "done": true
    }))
}

async fn mock_privacy(server: &MockServer, answer: &str) {
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("隐私检测专家"))
        .respond_with(classifier_answer(answer))
        .mount(server)
        .await;
}

async fn mock_complexity(server: &MockServer, answer: &str) {
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("复杂度分析专家"))
        .respond_with(classifier_answer(answer))
        .mount(server)
        .await;
}

async fn mock_local_generation(server: &MockServer, fragments: &[&str]) {
    let mut body = String::new();
    for fragment in fragments {
        body.push_str(&serde_json::json!({
            "message": { "role": "assistant", "content": fragment },
            "done": false
        }).to_string());
        body.push('\n');
    }
    body.push_str("{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n");

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

fn chunk_text(events: &[ChatEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn crisis_turn_short_circuits_without_generation() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    // Neither classifier nor backend may be called on a crisis turn.
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&ollama)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&modelscope)
        .await;

    let user = db.create_user("alice", "token-a").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "我想自杀", None).await;

    assert_eq!(events.len(), 2);
    let session_id = match &events[0] {
        ChatEvent::Crisis { content, session_id } => {
            assert!(content.contains("紧急求助方式"));
            *session_id
        }
        other => panic!("expected crisis event, got {other:?}"),
    };
    assert_eq!(events[1], ChatEvent::End);

    let session = db.session(session_id).await.expect("query").expect("session");
    assert_eq!(session.status, SessionStatus::Crisis);
    assert_eq!(session.round_count, 1);

    let messages = db.recent_messages(session_id, 20).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].agent_type.as_deref(), Some("SafetyAgent"));
    assert_eq!(messages[1].model_used.as_deref(), Some("local"));
}

#[tokio::test]
async fn plain_turn_stays_emotional_and_routes_local() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通情绪表达").await;
    mock_complexity(&ollama, "否|简单的情绪倾诉").await;
    mock_local_generation(&ollama, &["我听见你了", "，慢慢说。"]).await;

    let user = db.create_user("bob", "token-b").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "我今天很难过", None).await;

    let session_id = match &events[0] {
        ChatEvent::Metadata {
            session_id,
            phase,
            round_count,
            is_privacy,
            is_complex,
            model_used,
        } => {
            assert_eq!(*phase, Phase::Emotional);
            assert_eq!(*round_count, 1);
            assert!(!*is_privacy);
            assert!(!*is_complex);
            assert_eq!(model_used.as_str(), "local-Qwen3-4B");
            *session_id
        }
        other => panic!("expected metadata event, got {other:?}"),
    };
    assert_eq!(chunk_text(&events), "我听见你了，慢慢说。");
    assert_eq!(events.last(), Some(&ChatEvent::End));

    let messages = db.recent_messages(session_id, 20).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "我听见你了，慢慢说。");
    assert_eq!(messages[1].agent_type.as_deref(), Some("ConversationAgent"));
    assert_eq!(messages[1].model_used.as_deref(), Some("local-Qwen3-4B"));
}

#[tokio::test]
async fn privacy_turn_forces_local_and_skips_complexity() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("隐私检测专家"))
        .respond_with(classifier_answer("是|涉及恋爱关系隐私"))
        .expect(1)
        .mount(&ollama)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("复杂度分析专家"))
        .respond_with(classifier_answer("是|需要详细的行动方案"))
        .expect(0)
        .mount(&ollama)
        .await;
    mock_local_generation(&ollama, &["我明白这对你有多难。"]).await;

    // The remote backend must never see privacy-sensitive content.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&modelscope)
        .await;

    let user = db.create_user("carol", "token-c").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "我男朋友劈腿了，我该怎么办", None).await;

    match &events[0] {
        ChatEvent::Metadata {
            phase,
            is_privacy,
            is_complex,
            model_used,
            ..
        } => {
            // Solution-seeking phrasing still drives the phase override,
            // but routing stays local.
            assert_eq!(*phase, Phase::Solution);
            assert!(*is_privacy);
            assert!(!*is_complex);
            assert_eq!(model_used.as_str(), "local-Qwen3-4B");
        }
        other => panic!("expected metadata event, got {other:?}"),
    }
    assert_eq!(events.last(), Some(&ChatEvent::End));
}

#[tokio::test]
async fn complex_turn_escalates_to_remote() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通学习话题").await;
    mock_complexity(&ollama, "是|需要详细的行动方案").await;

    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"第一步\"},\"index\":0}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"，先明确目标。\"},\"index\":0}]}\n\n",
        "data: not-json\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body),
        )
        .expect(1)
        .mount(&modelscope)
        .await;

    let user = db.create_user("dave", "token-d").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "请帮我制定一个详细的学习提升路线", None).await;

    match &events[0] {
        ChatEvent::Metadata {
            is_privacy,
            is_complex,
            model_used,
            ..
        } => {
            assert!(!*is_privacy);
            assert!(*is_complex);
            assert_eq!(model_used.as_str(), "remote-Qwen3-Next-80B");
        }
        other => panic!("expected metadata event, got {other:?}"),
    }
    // The malformed frame is skipped, not fatal.
    assert_eq!(chunk_text(&events), "第一步，先明确目标。");
    assert_eq!(events.last(), Some(&ChatEvent::End));
}

#[tokio::test]
async fn classifier_failure_degrades_to_keyword_heuristics() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    // Classifier calls fail; generation still works.
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_string_contains("隐私检测专家"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&ollama)
        .await;
    mock_local_generation(&ollama, &["听起来真的很受伤。"]).await;

    let user = db.create_user("erin", "token-e").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "我男朋友劈腿了，我该怎么办", None).await;

    match &events[0] {
        ChatEvent::Metadata {
            is_privacy,
            is_complex,
            model_used,
            ..
        } => {
            // Keyword fallback catches the romantic-relationship term and the
            // turn stays on the local path with complexity never evaluated.
            assert!(*is_privacy);
            assert!(!*is_complex);
            assert_eq!(model_used.as_str(), "local-Qwen3-4B");
        }
        other => panic!("expected metadata event, got {other:?}"),
    }
    assert_eq!(events.last(), Some(&ChatEvent::End));
}

#[tokio::test]
async fn local_backend_failure_still_completes_turn() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通情绪表达").await;
    mock_complexity(&ollama, "否|简单的情绪倾诉").await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .and(body_partial_json(serde_json::json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .mount(&ollama)
        .await;

    let user = db.create_user("frank", "token-f").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "我今天很难过", None).await;

    assert!(matches!(events[0], ChatEvent::Metadata { .. }));
    let text = chunk_text(&events);
    assert!(text.contains("[错误] 本地模型调用失败"), "got: {text}");
    assert_eq!(events.last(), Some(&ChatEvent::End));
}

#[tokio::test]
async fn remote_backend_failure_still_completes_turn() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通学习话题").await;
    mock_complexity(&ollama, "是|需要详细的行动方案").await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&modelscope)
        .await;

    let user = db.create_user("gina", "token-g").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let events = run_turn(&coordinator, &user, "请帮我制定一个详细的学习提升路线", None).await;

    assert!(matches!(events[0], ChatEvent::Metadata { .. }));
    let text = chunk_text(&events);
    assert!(text.contains("错误：云端模型调用失败 (503)"), "got: {text}");
    assert_eq!(events.last(), Some(&ChatEvent::End));
}

#[tokio::test]
async fn sixth_round_moves_emotional_session_to_rational() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通情绪表达").await;
    mock_complexity(&ollama, "否|简单的情绪倾诉").await;
    mock_local_generation(&ollama, &["我们可以梳理一下思路。"]).await;

    let user = db.create_user("hana", "token-h").await.expect("user");
    let session = db.create_session(user.id).await.expect("session");
    for _ in 0..5 {
        db.begin_round(session.id).await.expect("round");
    }

    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());
    let events = run_turn(&coordinator, &user, "我只是想聊聊", Some(session.id)).await;

    match &events[0] {
        ChatEvent::Metadata {
            session_id,
            phase,
            round_count,
            ..
        } => {
            assert_eq!(*session_id, session.id);
            assert_eq!(*round_count, 6);
            assert_eq!(*phase, Phase::Rational);
        }
        other => panic!("expected metadata event, got {other:?}"),
    }

    let stored = db.session(session.id).await.expect("query").expect("session");
    assert_eq!(stored.phase, Phase::Rational);
}

#[tokio::test]
async fn round_count_tracks_user_turns_and_history_stays_ordered() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通情绪表达").await;
    mock_complexity(&ollama, "否|简单的情绪倾诉").await;
    mock_local_generation(&ollama, &["嗯，我在听。"]).await;

    let user = db.create_user("ivan", "token-i").await.expect("user");
    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());

    let first = run_turn(&coordinator, &user, "今天有点累", None).await;
    let session_id = match &first[0] {
        ChatEvent::Metadata { session_id, .. } => *session_id,
        other => panic!("expected metadata event, got {other:?}"),
    };
    run_turn(&coordinator, &user, "睡得也不太好", Some(session_id)).await;
    run_turn(&coordinator, &user, "总是胡思乱想", Some(session_id)).await;

    let session = db.session(session_id).await.expect("query").expect("session");
    assert_eq!(session.round_count, 3);

    let messages = db.recent_messages(session_id, 20).await.expect("messages");
    assert_eq!(messages.len(), 6);
    assert_eq!(
        messages.iter().filter(|m| m.role == "user").count() as i64,
        session.round_count
    );
    for pair in messages.windows(2) {
        assert!(pair[0].id < pair[1].id);
        assert!(pair[0].created_at <= pair[1].created_at);
    }
    let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(
        roles,
        ["user", "assistant", "user", "assistant", "user", "assistant"]
    );
}

#[tokio::test]
async fn disconnect_mid_stream_skips_assistant_persistence() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通情绪表达").await;
    mock_complexity(&ollama, "否|简单的情绪倾诉").await;
    mock_local_generation(&ollama, &["第一段", "第二段", "第三段"]).await;

    let user = db.create_user("lena", "token-l").await.expect("user");
    let coordinator = Arc::new(build_coordinator(
        db.clone(),
        &ollama.uri(),
        &modelscope.uri(),
    ));

    // Backpressured channel so generation cannot outrun the receiver.
    let (tx, mut rx) = mpsc::channel(1);
    let task = {
        let coordinator = coordinator.clone();
        let user = user.clone();
        tokio::spawn(async move {
            coordinator
                .process_turn(&user, "我今天很难过", None, &tx)
                .await
        })
    };

    // Walk away after the metadata event, like a closed client connection.
    let session_id = match rx.recv().await.expect("metadata") {
        ChatEvent::Metadata { session_id, .. } => session_id,
        other => panic!("expected metadata event, got {other:?}"),
    };
    drop(rx);

    task.await.expect("join").expect("turn");

    // Only the user turn is on record; the partial response was dropped.
    let messages = db.recent_messages(session_id, 20).await.expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");

    let session = db.session(session_id).await.expect("query").expect("session");
    assert_eq!(session.round_count, 1);
    assert_eq!(session.status, SessionStatus::Ongoing);
}

#[tokio::test]
async fn unavailable_session_reference_creates_fresh_session() {
    let db = setup_test_db().await;
    let ollama = MockServer::start().await;
    let modelscope = MockServer::start().await;

    mock_privacy(&ollama, "否|普通情绪表达").await;
    mock_complexity(&ollama, "否|简单的情绪倾诉").await;
    mock_local_generation(&ollama, &["我在呢。"]).await;

    let user = db.create_user("judy", "token-j").await.expect("user");
    let other = db.create_user("kyle", "token-k").await.expect("user");
    let foreign_session = db.create_session(other.id).await.expect("session");

    let coordinator = build_coordinator(db.clone(), &ollama.uri(), &modelscope.uri());
    let events = run_turn(&coordinator, &user, "你好", Some(foreign_session.id)).await;

    match &events[0] {
        ChatEvent::Metadata {
            session_id,
            round_count,
            ..
        } => {
            assert_ne!(*session_id, foreign_session.id);
            assert_eq!(*round_count, 1);
        }
        other => panic!("expected metadata event, got {other:?}"),
    }

    // The foreign session is untouched.
    let foreign = db
        .session(foreign_session.id)
        .await
        .expect("query")
        .expect("session");
    assert_eq!(foreign.round_count, 0);
}
