//! Mailbox producer: Email cards for messages related to the plan
//!
//! Reads a plain mailbox dump from the scope root, one message per line in
//! the form `to:<address> <subject>`, and ranks subjects by the words they
//! share with the plan.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;

use super::{ProduceRequest, Producer, ProducerError};
use crate::cards::{Card, CardCategory};
use crate::config::ProducersConfig;

const MAX_EMAILS: usize = 2;
const MIN_WORD_CHARS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub to: String,
    pub subject: String,
}

impl MailboxEntry {
    fn text(&self) -> String {
        format!("To: {}\nSubject: {}", self.to, self.subject)
    }
}

#[derive(Clone, Debug)]
pub struct EmailProducer {
    mailbox_file: String,
}

impl EmailProducer {
    pub fn new(mailbox_file: impl Into<String>) -> Self {
        Self {
            mailbox_file: mailbox_file.into(),
        }
    }

    pub fn from_config(config: &ProducersConfig) -> Self {
        Self::new(config.mailbox_file.clone())
    }

    /// Plan file contents when the plan path is readable, else the document
    async fn plan_text(request: &ProduceRequest) -> String {
        if let Some(plan_path) = &request.global_context.plan_path {
            match tokio::fs::read_to_string(plan_path).await {
                Ok(content) if !content.trim().is_empty() => return content,
                Ok(_) => {}
                Err(e) => tracing::debug!(path = %plan_path.display(), error = %e, "plan file unreadable"),
            }
        }
        request.document_text.clone()
    }
}

/// Entries of a mailbox dump; blank and malformed lines are skipped
pub fn parse_mailbox(content: &str) -> Vec<MailboxEntry> {
    content
        .lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("to:"))
        .filter_map(|rest| {
            let mut parts = rest.trim().splitn(2, ' ');
            let to = parts.next().filter(|a| !a.is_empty())?;
            let subject = parts
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or("No Subject");
            Some(MailboxEntry {
                to: to.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_CHARS)
        .map(str::to_lowercase)
        .collect()
}

/// Entries sharing at least one word with `plan`, best first, at most two
pub fn rank_entries<'a>(entries: &'a [MailboxEntry], plan: &str) -> Vec<&'a MailboxEntry> {
    let plan_words = words(plan);
    let mut scored: Vec<(usize, usize, &MailboxEntry)> = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let shared = words(&entry.subject).intersection(&plan_words).count();
            (shared, i, entry)
        })
        .filter(|(shared, _, _)| *shared > 0)
        .collect();
    // stable order among equal scores: mailbox order
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(MAX_EMAILS)
        .map(|(_, _, entry)| entry)
        .collect()
}

async fn load_mailbox(path: &Path) -> Result<Option<Vec<MailboxEntry>>, ProducerError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(parse_mailbox(&content))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProducerError::Process(format!(
            "cannot read mailbox {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl Producer for EmailProducer {
    fn name(&self) -> &str {
        "emails"
    }

    async fn available(&self) -> Result<bool, ProducerError> {
        Ok(true)
    }

    async fn produce(&self, request: &ProduceRequest) -> Result<Vec<Card>, ProducerError> {
        let path = request.global_context.scope_root.join(&self.mailbox_file);
        let Some(entries) = load_mailbox(&path).await? else {
            tracing::debug!(path = %path.display(), "no mailbox in scope");
            return Ok(Vec::new());
        };
        let plan = Self::plan_text(request).await;

        let cards = rank_entries(&entries, &plan)
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let mut card = Card::new(format!("Email: {}", entry.subject), entry.text(), CardCategory::Email)
                    .with_metadata("source", self.name())
                    .with_metadata("email_number", i + 1);
                if let Some(plan_path) = &request.global_context.plan_path {
                    card = card.with_metadata("plan_path", plan_path.to_string_lossy().into_owned());
                }
                card
            })
            .collect();
        Ok(cards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::GlobalContext;
    use crate::producers::CursorPosition;

    const MAILBOX: &str = "\
to:ops@example.com Retry budget for the fetcher
not a message line

to:lead@example.com Quarterly planning offsite
to:db@example.com
to:sre@example.com Fetcher timeouts in staging
";

    #[test]
    fn mailbox_lines_are_parsed() {
        let entries = parse_mailbox(MAILBOX);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].to, "ops@example.com");
        assert_eq!(entries[0].subject, "Retry budget for the fetcher");
        assert_eq!(entries[2].subject, "No Subject");
    }

    #[test]
    fn ranking_prefers_more_shared_words() {
        let entries = parse_mailbox(MAILBOX);
        let ranked = rank_entries(&entries, "# Plan\nAdd retry logic to the fetcher and handle timeouts\n");
        let subjects: Vec<_> = ranked.iter().map(|e| e.subject.as_str()).collect();
        assert_eq!(
            subjects,
            vec!["Retry budget for the fetcher", "Fetcher timeouts in staging"]
        );
        assert!(rank_entries(&entries, "nothing in common").is_empty());
    }

    #[tokio::test]
    async fn missing_mailbox_yields_no_cards() {
        let producer = EmailProducer::new("no-such-mailbox.txt");
        let request = ProduceRequest {
            document_text: "Add retries to the fetcher".into(),
            cursor: CursorPosition::default(),
            global_context: GlobalContext::new(std::env::temp_dir(), None),
        };
        assert!(producer.produce(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mailbox_in_scope_root_becomes_email_cards() {
        let dir = std::env::temp_dir().join(format!("parallizer-mail-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("mailbox.txt"), MAILBOX).await.unwrap();

        let producer = EmailProducer::new("mailbox.txt");
        let request = ProduceRequest {
            document_text: "Tune the fetcher retry budget".into(),
            cursor: CursorPosition::default(),
            global_context: GlobalContext::new(&dir, None),
        };
        let cards = producer.produce(&request).await.unwrap();
        tokio::fs::remove_dir_all(&dir).await.unwrap();

        assert_eq!(cards.len(), 2);
        assert!(cards.iter().all(|c| c.category() == CardCategory::Email));
        assert_eq!(cards[0].header(), "Email: Retry budget for the fetcher");
        assert_eq!(cards[0].text(), "To: ops@example.com\nSubject: Retry budget for the fetcher");
    }
}
