//! Stream interceptor scenarios driven end-to-end through the collector
//! and the dedicated writer task.

mod common;

use rag_proxy::interceptor::{writer, StreamInterceptor};
use tokio::sync::mpsc;

struct Harness {
    interceptor: StreamInterceptor,
    body_rx: mpsc::Receiver<Result<axum::body::Bytes, std::io::Error>>,
    done: tokio::sync::oneshot::Receiver<()>,
}

fn harness(app: std::sync::Arc<rag_proxy::AppContext>) -> Harness {
    let (packet_tx, packet_rx) = mpsc::channel(64);
    let (body_tx, body_rx) = mpsc::channel(64);
    let done = writer::spawn(packet_rx, body_tx);
    Harness {
        interceptor: StreamInterceptor::new(app, packet_tx),
        body_rx,
        done,
    }
}

fn stream_frame(text: &str) -> String {
    format!(
        "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
        serde_json::to_string(text).unwrap()
    )
}

async fn drain(mut harness: Harness) -> Vec<String> {
    drop(harness.interceptor);
    let _ = harness.done.await;
    let mut frames = Vec::new();
    while let Some(Ok(bytes)) = harness.body_rx.recv().await {
        frames.push(String::from_utf8(bytes.to_vec()).unwrap());
    }
    frames
}

fn delta_of(frame: &str) -> Option<String> {
    let payload = frame.strip_prefix("data: ")?.trim_end();
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string)
}

#[tokio::test]
async fn forbidden_phrase_is_replaced_before_the_client_sees_it() {
    let h = harness(common::test_app());
    for text in ["This is ", "a forbidden ", "phrase."] {
        h.interceptor.write(stream_frame(text).as_bytes()).await;
    }
    h.interceptor.write(b"data: [DONE]\n\n").await;
    let outcome = h.interceptor.finish().await;

    assert!(outcome.complete);
    assert_eq!(outcome.assistant_text, "This is a *** phrase.");

    let frames = drain(h).await;
    let last = frames.last().unwrap();
    assert!(last.contains("[DONE]"), "stream must end with the finish frame");

    let mut reassembled = String::new();
    for frame in &frames[..frames.len() - 1] {
        assert!(
            !frame.contains("forbidden"),
            "no frame may carry the original phrase: {frame}"
        );
        reassembled.push_str(&delta_of(frame).unwrap());
    }
    assert_eq!(reassembled, "This is a *** phrase.");
}

#[tokio::test]
async fn clean_stream_passes_through_byte_identical() {
    let h = harness(common::test_app());
    // long enough to cross the lookahead threshold several times
    let inputs = [
        "The quick brown fox jumps over the lazy dog. ",
        "Nothing here needs rewriting at all, ",
        "so every frame goes out exactly as it came in. ",
        "One more sentence for good measure.",
    ];
    let mut sent = Vec::new();
    for text in inputs {
        let frame = stream_frame(text);
        h.interceptor.write(frame.as_bytes()).await;
        sent.push(frame);
    }
    h.interceptor.write(b"data: [DONE]\n\n").await;
    let outcome = h.interceptor.finish().await;
    assert!(outcome.complete);
    assert_eq!(outcome.assistant_text, inputs.concat());

    let frames = drain(h).await;
    assert_eq!(frames.len(), sent.len() + 1);
    for (out, original) in frames.iter().zip(&sent) {
        assert_eq!(out, original, "untouched frames must be byte-identical");
    }
}

#[tokio::test]
async fn identity_rules_leave_the_stream_untouched() {
    let app = common::test_app_with(|c| {
        c.stream.replacer.clear();
        c.stream
            .replacer
            .entry("lazy".to_string())
            .or_default()
            // matches, but replaces with itself
            .insert("lazy dog".to_string(), "lazy dog".to_string());
    });
    let h = harness(app);
    let frame = stream_frame("The quick brown fox jumps over the lazy dog and naps.");
    h.interceptor.write(frame.as_bytes()).await;
    h.interceptor.write(b"data: [DONE]\n\n").await;
    h.interceptor.finish().await;

    let frames = drain(h).await;
    assert_eq!(frames[0], frame);
    assert!(frames[1].contains("[DONE]"));
}

#[tokio::test]
async fn direct_body_is_rewritten_with_usage_recount() {
    let app = common::test_app();
    let h = harness(app.clone());
    let body = serde_json::json!({
        "message": {"content": "answer with a forbidden phrase inside"},
        "usage": {"prompt_tokens": 7, "completion_tokens": 99, "total_tokens": 106}
    })
    .to_string();
    h.interceptor.write(body.as_bytes()).await;
    h.interceptor.finish().await;

    let frames = drain(h).await;
    let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    let text = value["message"]["content"].as_str().unwrap();
    assert_eq!(text, "answer with a *** inside");

    let completion = app.tokens.count(text);
    assert_eq!(value["usage"]["completion_tokens"].as_i64().unwrap(), completion);
    assert_eq!(
        value["usage"]["total_tokens"].as_i64().unwrap(),
        7 + completion
    );
}

#[tokio::test]
async fn unrecognized_chunks_are_forwarded_untouched() {
    let h = harness(common::test_app());
    h.interceptor.write(b"some opaque bytes").await;
    h.interceptor.finish().await;
    let frames = drain(h).await;
    assert_eq!(frames, vec!["some opaque bytes".to_string()]);
}

#[tokio::test]
async fn trigger_without_finish_still_substitutes_on_close() {
    let h = harness(common::test_app());
    h.interceptor
        .write(stream_frame("a forbidden phrase arrives ").as_bytes())
        .await;
    // upstream dies before the terminator frame
    let outcome = h.interceptor.finish().await;
    assert!(!outcome.complete);
    assert_eq!(outcome.assistant_text, "a *** arrives ");

    let frames = drain(h).await;
    for frame in &frames {
        assert!(!frame.contains("forbidden phrase"));
    }
    let reassembled: String = frames.iter().filter_map(|f| delta_of(f)).collect();
    assert_eq!(reassembled, "a *** arrives ");
}
