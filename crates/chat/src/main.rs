use std::io::Write;
use std::process::ExitCode;

use kbchat::chat::{ChatNotice, SessionOrchestrator};
use kbchat::settings::SettingsStore;

/// Sends one question to the configured dialog and streams the answer to stdout.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if question.trim().is_empty() {
        eprintln!("usage: kbchat <question>");
        return ExitCode::from(2);
    }

    let store = SettingsStore::load();
    let settings = store.settings();
    if !settings.is_valid() {
        eprintln!(
            "no dialog configured: set dialog_id in {} or KBCHAT_DIALOG_ID",
            store.config_path().display()
        );
        return ExitCode::from(2);
    }

    let backend = match kbchat_llm::create_backend(settings.backend_config()) {
        Ok(backend) => backend,
        Err(error) => {
            tracing::error!(error = %error, "failed to create backend");
            return ExitCode::FAILURE;
        }
    };

    let mut orchestrator = SessionOrchestrator::single(backend, settings.orchestrator_config());
    if let Some(box_id) = orchestrator.primary_box_id()
        && let Err(error) = orchestrator.set_box_config(box_id, settings.default_box_config())
    {
        tracing::warn!(error = %error, "keeping the dialog's default model");
    }

    if let Err(error) = orchestrator.dispatch_send(&question, Vec::new()) {
        tracing::error!(error = %error, "failed to send question");
        return ExitCode::FAILURE;
    }

    let mut stdout = std::io::stdout();
    let mut printed = 0;
    loop {
        let Some(notice) = orchestrator.pump().await else {
            continue;
        };

        match notice {
            ChatNotice::AnswerUpdated { box_id, message_id }
            | ChatNotice::AnswerCompleted { box_id, message_id } => {
                let content = orchestrator
                    .messages(box_id)
                    .iter()
                    .find(|message| message.id == message_id)
                    .map(|message| message.content.as_str())
                    .unwrap_or_default();

                // Answers arrive accumulated; print only what is new.
                if let Some(delta) = content.get(printed..) {
                    let _ = write!(stdout, "{delta}");
                    let _ = stdout.flush();
                    printed = content.len();
                }

                if notice.is_terminal() {
                    let _ = writeln!(stdout);
                    return ExitCode::SUCCESS;
                }
            }
            ChatNotice::ExchangeFailed { error, .. } => {
                eprintln!("\nerror: {error}");
                return ExitCode::FAILURE;
            }
            ChatNotice::ConversationPersisted { id } => {
                tracing::debug!(conversation_id = %id, "conversation saved");
            }
            ChatNotice::ConversationPersistFailed { id, error } => {
                tracing::warn!(conversation_id = %id, error = %error, "conversation not saved");
            }
        }
    }
}
