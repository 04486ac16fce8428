//! LLM-backed batch reviewer: prompt construction and response parsing.
//!
//! The model is asked for one JSON object
//! `{"summary": "...", "comments": [{"filePath", "lineNumber", "content", "severity", "suggestions"}]}`.
//! Code fences around the JSON and chatter before/after it are tolerated.

use ai_llm_service::LlmService;
use async_trait::async_trait;
use git_context_engine::git_providers::{
    CommentLocation, CommentSide, ReviewComment, Severity,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    errors::{Error, MrResult},
    review::{
        batch::{DiffBatch, render_file},
        factories::AiReviewer,
        types::BatchOutput,
    },
};

pub const REVIEW_SYSTEM_PROMPT: &str = "You are an expert code reviewer. You answer with strictly valid JSON only.";

/// Plain text generation; the seam between review logic and model backends.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> MrResult<String>;
}

#[async_trait]
impl TextGenerator for LlmService {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> MrResult<String> {
        Ok(LlmService::generate(self, prompt, system).await?)
    }
}

#[derive(Debug)]
pub struct LlmReviewer<G> {
    generator: G,
}

impl<G: TextGenerator> LlmReviewer<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl<G: TextGenerator> AiReviewer for LlmReviewer<G> {
    async fn review_batch(&self, batch: &DiffBatch) -> MrResult<BatchOutput> {
        let prompt = build_review_prompt(batch);
        debug!(
            batch = batch.index,
            files = batch.files.len(),
            prompt_chars = prompt.len(),
            "sending batch to model"
        );

        let raw = self
            .generator
            .generate(&prompt, Some(REVIEW_SYSTEM_PROMPT))
            .await?;
        parse_review_response(&raw)
    }
}

/// Review prompt for one batch. Diff lines carry their line numbers as
/// `L<n>` so the model can anchor comments.
pub fn build_review_prompt(batch: &DiffBatch) -> String {
    let mut s = String::new();
    s.push_str("Review the following code changes and provide actionable feedback.\n");
    s.push_str("Focus on correctness, potential bugs, security, performance and readability.\n\n");
    s.push_str("Format your response as a JSON object with this structure:\n");
    s.push_str("{\n");
    s.push_str("  \"summary\": \"Overall summary of the changes\",\n");
    s.push_str("  \"comments\": [\n");
    s.push_str("    {\n");
    s.push_str("      \"filePath\": \"path/to/file.ext\",\n");
    s.push_str("      \"lineNumber\": 42,\n");
    s.push_str("      \"content\": \"Your comment about the code\",\n");
    s.push_str("      \"severity\": \"critical|warning|info\",\n");
    s.push_str("      \"suggestions\": [\"Suggestion 1\"]\n");
    s.push_str("    }\n");
    s.push_str("  ]\n");
    s.push_str("}\n\n");
    s.push_str("Rules:\n");
    s.push_str("1. The response must be valid JSON; escape quotes inside strings.\n");
    s.push_str("2. Attach every comment to one file and one line.\n");
    s.push_str("3. Use the exact file paths shown below.\n");
    s.push_str("4. lineNumber is the integer after 'L' on the commented line.\n");
    s.push_str("5. Return an empty comments array when there is nothing to report.\n\n");
    s.push_str("Code changes:\n\n");

    for file in &batch.files {
        s.push_str(&render_file(file));
    }
    s
}

#[derive(Debug, Deserialize)]
struct WireReview {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    comments: Vec<WireComment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireComment {
    #[serde(default, alias = "file_path", alias = "file")]
    file_path: String,
    #[serde(default, alias = "line_number", alias = "line")]
    line_number: u32,
    #[serde(default, alias = "body")]
    content: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Parses the model output into summary and comments.
pub fn parse_review_response(raw: &str) -> MrResult<BatchOutput> {
    let json = extract_json_object(raw)
        .ok_or_else(|| Error::InvalidAiResponse("no JSON object in model output".into()))?;

    let wire: WireReview = serde_json::from_str(json)
        .map_err(|e| Error::InvalidAiResponse(format!("malformed review JSON: {e}")))?;

    let comments: Vec<ReviewComment> = wire
        .comments
        .into_iter()
        .filter_map(into_review_comment)
        .collect();

    if wire.summary.trim().is_empty() && comments.is_empty() {
        return Err(Error::InvalidAiResponse("empty summary and no comments".into()));
    }

    Ok(BatchOutput {
        summary: wire.summary.trim().to_string(),
        comments,
    })
}

fn into_review_comment(c: WireComment) -> Option<ReviewComment> {
    let content = c.content.trim();
    if content.is_empty() {
        warn!(path = %c.file_path, line = c.line_number, "dropping empty model comment");
        return None;
    }

    let mut body = content.to_string();
    let suggestions: Vec<&str> = c
        .suggestions
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if !suggestions.is_empty() {
        body.push_str("\n\n**Suggestions:**");
        for suggestion in suggestions {
            body.push_str("\n- ");
            body.push_str(suggestion);
        }
    }

    let location = (!c.file_path.trim().is_empty() && c.line_number > 0).then(|| CommentLocation {
        file_path: c.file_path.trim().to_string(),
        line: c.line_number,
        side: CommentSide::Right,
    });

    Some(ReviewComment {
        location,
        body,
        severity: parse_severity(&c.severity),
        category: if c.category.trim().is_empty() {
            "review".to_string()
        } else {
            c.category.trim().to_ascii_lowercase()
        },
    })
}

fn parse_severity(raw: &str) -> Severity {
    match raw.trim().to_ascii_lowercase().as_str() {
        "critical" | "high" | "error" | "blocker" => Severity::Critical,
        "warning" | "medium" | "warn" => Severity::Warning,
        _ => Severity::Info,
    }
}

/// Strips code fences, then takes the outermost `{ ... }` span.
fn extract_json_object(raw: &str) -> Option<&str> {
    let mut t = raw.trim();
    if t.starts_with("```") {
        t = t.trim_start_matches("```json").trim_start_matches("```");
        if let Some(pos) = t.rfind("```") {
            t = &t[..pos];
        }
    }
    let start = t.find('{')?;
    let end = t.rfind('}')?;
    (start < end).then(|| &t[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGenerator, file_change, hunk};

    fn batch() -> DiffBatch {
        let files = vec![file_change("src/net.rs", vec![hunk(10, &["let n = buf.len() + 1;"])])];
        DiffBatch {
            index: 1,
            estimated_tokens: crate::review::batch::batch_tokens(&files),
            files,
        }
    }

    #[test]
    fn prompt_lists_files_with_line_numbers() {
        let p = build_review_prompt(&batch());
        assert!(p.contains("FILE src/net.rs\n@@ -10,0 +10,1 @@\nL10 +let n = buf.len() + 1;"));
    }

    #[test]
    fn parses_fenced_json_with_aliases() {
        let raw = "```json\n{\"summary\": \"Adds length math\", \"comments\": [\
            {\"filePath\": \"src/net.rs\", \"lineNumber\": 10, \"content\": \"Possible overflow\", \"severity\": \"HIGH\", \"suggestions\": [\"use checked_add\"]},\
            {\"file_path\": \"src/net.rs\", \"line\": 0, \"body\": \"General note\"},\
            {\"filePath\": \"src/net.rs\", \"lineNumber\": 11, \"content\": \"  \"}\
            ]}\n```";

        let out = parse_review_response(raw).unwrap();
        assert_eq!(out.summary, "Adds length math");
        assert_eq!(out.comments.len(), 2);
        assert_eq!(out.comments[0].severity, Severity::Critical);
        assert!(out.comments[0].body.ends_with("- use checked_add"));
        assert_eq!(out.comments[0].location.as_ref().unwrap().line, 10);
        assert!(out.comments[1].location.is_none());
    }

    #[test]
    fn rejects_non_json_output() {
        assert!(matches!(
            parse_review_response("I could not review this."),
            Err(Error::InvalidAiResponse(_))
        ));
        assert!(parse_review_response("{\"summary\": \"\", \"comments\": []}").is_err());
    }

    #[tokio::test]
    async fn reviewer_sends_system_prompt() {
        let generator = ScriptedGenerator::new(vec![Ok("{\"summary\": \"ok\", \"comments\": []}".into())]);
        let reviewer = LlmReviewer::new(generator);

        let out = reviewer.review_batch(&batch()).await.unwrap();
        assert_eq!(out.summary, "ok");

        let prompts = reviewer.generator.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].1.as_deref(), Some(REVIEW_SYSTEM_PROMPT));
    }
}
