use std::io::Write;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use convograph_llm::{ChatCompletionService, ChatTurn};
use convograph_memory::Sender;

use crate::context::AppContext;
use crate::graph_cmds::print_stats;
use crate::recorder::Recorder;

enum LineCommand<'a> {
    Exit,
    Help,
    Stats,
    Unknown(&'a str),
    Say(&'a str),
}

fn parse_line(line: &str) -> Option<LineCommand<'_>> {
    let line = line.trim();
    match line {
        "" => None,
        "/exit" | "exit" => Some(LineCommand::Exit),
        "/help" => Some(LineCommand::Help),
        "/stats" => Some(LineCommand::Stats),
        other if other.starts_with('/') => Some(LineCommand::Unknown(other)),
        other => Some(LineCommand::Say(other)),
    }
}

pub(crate) async fn run_chat_session(ctx: &AppContext) -> Result<()> {
    println!(
        "{} is ready. Type /help for commands, /exit to quit.",
        ctx.config.agent.name
    );
    let stdin = BufReader::new(tokio::io::stdin());
    let mut history = vec![ChatTurn::system(ctx.config.agent.system_prompt.clone())];
    chat_loop(ctx, ctx.llm.as_ref(), &ctx.recorder, stdin, &mut history).await?;
    println!("session closed");
    Ok(())
}

/// Drive one conversation until `/exit` or end of input.
async fn chat_loop<R>(
    ctx: &AppContext,
    chat: &dyn ChatCompletionService,
    recorder: &Recorder,
    input: R,
    history: &mut Vec<ChatTurn>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };

        match parse_line(&line) {
            None => continue,
            Some(LineCommand::Exit) => break,
            Some(LineCommand::Help) => {
                println!("/stats  graph counts");
                println!("/help   this list");
                println!("/exit   end the session");
            }
            Some(LineCommand::Stats) => match &ctx.store {
                Some(store) => match store.stats() {
                    Ok(stats) => print_stats(&stats),
                    Err(err) => eprintln!("stats unavailable: {err}"),
                },
                None => println!("no graph store configured (jsonl backend)"),
            },
            Some(LineCommand::Unknown(command)) => {
                println!("unknown command {command}; try /help");
            }
            Some(LineCommand::Say(text)) => {
                exchange(ctx, chat, recorder, text, history).await;
            }
        }
    }
    Ok(())
}

/// One human turn and its reply.  Failures are reported and the session goes on.
async fn exchange(
    ctx: &AppContext,
    chat: &dyn ChatCompletionService,
    recorder: &Recorder,
    text: &str,
    history: &mut Vec<ChatTurn>,
) {
    match recorder.record(Sender::Human, text).await {
        Ok(recorded) => debug!(message_id = %recorded.message_id(), "human turn recorded"),
        Err(err) => warn!(error = %err, "failed to record human turn"),
    }
    history.push(ChatTurn::user(text));

    let reply = match chat.reply(history).await {
        Ok(reply) => reply,
        Err(err) => {
            eprintln!("chat completion failed: {err}");
            return;
        }
    };
    println!("{}: {reply}", ctx.config.agent.name);

    match recorder.record(Sender::Ai, &reply).await {
        Ok(recorded) => debug!(message_id = %recorded.message_id(), "ai turn recorded"),
        Err(err) => warn!(error = %err, "failed to record ai turn"),
    }
    history.push(ChatTurn::assistant(reply));
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use convograph_config::{AppConfig, GraphBackend, GraphScope};
    use std::sync::Mutex;

    struct ScriptedChat {
        replies: Mutex<Vec<Result<String, String>>>,
        seen: Mutex<Vec<usize>>,
    }

    impl ScriptedChat {
        fn new(replies: Vec<Result<String, String>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatCompletionService for ScriptedChat {
        async fn reply(&self, history: &[ChatTurn]) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(history.len());
            match self.replies.lock().unwrap().remove(0) {
                Ok(reply) => Ok(reply),
                Err(err) => bail!(err),
            }
        }
    }

    fn memory_context() -> AppContext {
        let mut config = AppConfig::default();
        config.graph.backend = GraphBackend::Memory;
        config.graph.scope = GraphScope::Global;
        config.llm.ollama_base_url = "http://127.0.0.1:9".to_string();
        config.llm.request_timeout_secs = 1;
        AppContext::build(config).unwrap()
    }

    #[test]
    fn line_commands_are_recognized() {
        assert!(parse_line("   ").is_none());
        assert!(matches!(parse_line("exit"), Some(LineCommand::Exit)));
        assert!(matches!(parse_line(" /exit "), Some(LineCommand::Exit)));
        assert!(matches!(parse_line("/stats"), Some(LineCommand::Stats)));
        assert!(matches!(parse_line("/nope"), Some(LineCommand::Unknown("/nope"))));
        assert!(matches!(parse_line(" mua áo "), Some(LineCommand::Say("mua áo"))));
    }

    #[tokio::test]
    async fn both_turns_are_stored_even_when_collaborators_are_down() {
        let ctx = memory_context();
        let chat = ScriptedChat::new(vec![Ok("Dạ, shop có áo ạ.".to_string())]);
        let mut history = vec![ChatTurn::system("sys")];

        let input = "Tôi muốn mua áo\n/exit\nnever read\n".as_bytes();
        chat_loop(&ctx, &chat, &ctx.recorder, input, &mut history)
            .await
            .unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(history[2], ChatTurn::assistant("Dạ, shop có áo ạ."));
        let stats = ctx.store.as_ref().unwrap().stats().unwrap();
        assert_eq!(stats.messages, 2);
        assert_eq!(stats.contextual_links, 0);
    }

    #[tokio::test]
    async fn chat_failure_keeps_the_session_alive() {
        let ctx = memory_context();
        let chat = ScriptedChat::new(vec![
            Err("model overloaded".to_string()),
            Ok("Chào bạn!".to_string()),
        ]);
        let mut history = vec![ChatTurn::system("sys")];

        let input = "xin chào\nxin chào lần nữa\n".as_bytes();
        chat_loop(&ctx, &chat, &ctx.recorder, input, &mut history)
            .await
            .unwrap();

        assert_eq!(*chat.seen.lock().unwrap(), vec![2, 3]);
        let stats = ctx.store.as_ref().unwrap().stats().unwrap();
        assert_eq!(stats.messages, 3);
    }
}
