//! Wrapped agent example: sync, async and streaming calls on one agent

use async_trait::async_trait;
use loopscope::prelude::*;
use loopscope::TraceQuery;
use serde_json::json;
use std::sync::Arc;
use std::vec::IntoIter;

struct EchoAgent {
    prefix: String,
}

impl Invoke for EchoAgent {
    type Input = String;
    type Output = String;
    type Error = String;

    fn invoke(&self, input: String) -> std::result::Result<String, String> {
        if input.is_empty() {
            return Err("empty prompt".to_string());
        }
        Ok(format!("{}{}", self.prefix, input))
    }
}

#[async_trait]
impl AsyncInvoke for EchoAgent {
    type Input = String;
    type Output = String;
    type Error = String;

    async fn ainvoke(&self, input: String) -> std::result::Result<String, String> {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.invoke(input)
    }
}

impl StreamInvoke for EchoAgent {
    type Input = String;
    type Chunk = String;
    type Error = String;
    type Stream = IntoIter<std::result::Result<String, String>>;

    fn stream(&self, input: String) -> Self::Stream {
        set_context(TraceContext::default().with_entry("words", json!(input.split_whitespace().count())));
        input
            .split_whitespace()
            .map(|word| Ok(format!("{} ", word)))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Loopscope Wrapped Agent Example ===\n");

    let storage = Arc::new(SqliteStorage::open("loopscope_demo.db")?);
    let agent = Monitor::new("echo_agent")
        .with_storage(storage.clone())
        .wrap_agent(EchoAgent {
            prefix: "echo: ".to_string(),
        });

    println!("invoke  -> {:?}", agent.invoke("hello".to_string()));
    println!("invoke  -> {:?}", agent.invoke(String::new()));
    println!("ainvoke -> {:?}", agent.ainvoke("from async".to_string()).await);

    let streamed: Vec<String> = agent
        .stream("one two three".to_string())
        .filter_map(|chunk| chunk.ok())
        .collect();
    println!("stream  -> {:?}", streamed.concat());

    println!("\n📊 Recent traces:");
    for trace in storage.list_traces(&TraceQuery::new().with_limit(4))? {
        println!(
            "  - {} {} method={} output={}",
            trace.id,
            trace.status,
            trace.metadata.get("method").cloned().unwrap_or_default(),
            trace.output
        );
    }

    Ok(())
}
