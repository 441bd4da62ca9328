use std::sync::Arc;

use futures::future::join_all;

use crate::agent::Task;
use crate::meeting::CaptionPad;
use crate::translate::Translator;

/// Routes each transcription fragment to the right set of caption pads.
///
/// In transcribe mode only English pads are touched. In translate mode the
/// English pads get the fragment verbatim while every other pad gets a
/// machine translation; targets run concurrently and a failed target is
/// skipped without affecting the others (no fallback to the source text).
pub struct TranslationRouter {
    translator: Arc<dyn Translator>,
}

impl TranslationRouter {
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self { translator }
    }

    pub async fn route(&self, task: Task, fragment: &str, pads: &[Arc<dyn CaptionPad>]) {
        match task {
            Task::Transcribe => {
                for pad in pads.iter().filter(|pad| pad.language() == "en") {
                    if let Err(e) = pad.set_text(fragment).await {
                        tracing::warn!("Pad write failed: {e}");
                    }
                }
            }
            Task::Translate => {
                let jobs = pads.iter().map(|pad| async move {
                    let language = pad.language();
                    if language == "en" {
                        if let Err(e) = pad.set_text(fragment).await {
                            tracing::warn!("Pad write failed: {e}");
                        }
                        return;
                    }
                    match self.translator.translate(fragment, "en", &language).await {
                        Ok(translated) => {
                            if let Err(e) = pad.set_text(&translated).await {
                                tracing::warn!("Pad write failed ({language}): {e}");
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Translation to '{language}' failed: {e}");
                        }
                    }
                });
                join_all(jobs).await;
            }
        }
    }
}
