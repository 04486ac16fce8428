//! In-memory doubles shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use git_context_engine::{
    credentials::{StaticTokenStore, TokenEntry, TokenStore},
    errors::{GitContextEngineProviderError, GitContextEngineResult, GitContextEngineWebhookError},
    git_providers::{
        AuthorInfo, ChangeRequest, ChangeRequestId, ChangeSet, CommentLocation, CommentSide,
        DiffHunk, DiffLine, DiffRefs, FileChange, ProviderKind, ReviewComment, ReviewProvider,
        Severity,
    },
    unified::{
        BotIdentity, EventPayload, UnifiedComment, UnifiedCommit, UnifiedDiscussion,
        UnifiedMergeRequest, UnifiedRepository, UnifiedReviewerChange, UnifiedUser,
        UnifiedWebhookEvent,
    },
    webhooks::{WebhookAdapter, WebhookKind},
};
use reqwest::header::HeaderMap;

use crate::{
    errors::{Error, MrResult},
    review::{
        AiProviderFactory, AiReviewer, AiSettings, BatchOutput, DiffBatch, ProviderFactory,
        ProviderSettings, ReviewConfig, ReviewRequest, ReviewService, TextGenerator,
    },
};

pub const MR_URL: &str = "https://gitlab.example.com/group/project/-/merge_requests/42";

pub fn user(username: &str) -> UnifiedUser {
    UnifiedUser {
        id: format!("u-{username}"),
        username: username.to_string(),
        name: String::new(),
        ..Default::default()
    }
}

fn repository() -> UnifiedRepository {
    UnifiedRepository {
        id: "7".into(),
        name: "project".into(),
        full_name: "group/project".into(),
        owner: user("group"),
        web_url: "https://gitlab.example.com/group/project".into(),
    }
}

fn merge_request() -> UnifiedMergeRequest {
    UnifiedMergeRequest {
        id: "4200".into(),
        number: 42,
        title: "Cache parsed configuration".into(),
        state: "opened".into(),
        author: user("alice"),
        web_url: MR_URL.into(),
        ..Default::default()
    }
}

/// Note whose creation minute follows its numeric id.
pub fn note(id: &str, author: &str, body: &str) -> UnifiedComment {
    let minute = id.parse::<u64>().unwrap_or(0) % 60;
    let ts = format!("2024-05-01T10:{minute:02}:00Z");
    UnifiedComment {
        id: id.to_string(),
        body: body.to_string(),
        created_at: ts.clone(),
        updated_at: ts,
        author: user(author),
        position: None,
        discussion_id: None,
        in_reply_to_id: None,
        system: false,
        web_url: None,
        metadata: BTreeMap::new(),
    }
}

pub fn comment_event(
    id: &str,
    author: &str,
    body: &str,
    discussion_id: Option<&str>,
) -> UnifiedWebhookEvent {
    let mut comment = note(id, author, body);
    comment.created_at = "2024-05-01T12:00:00Z".into();
    comment.discussion_id = discussion_id.map(str::to_string);

    UnifiedWebhookEvent {
        provider: "gitlab".into(),
        timestamp: comment.created_at.clone(),
        actor: user(author),
        repository: repository(),
        merge_request: Some(merge_request()),
        payload: EventPayload::Comment(comment),
    }
}

pub fn reviewer_event(previous: &[&str], current: &[&str]) -> UnifiedWebhookEvent {
    let change = UnifiedReviewerChange {
        action: "updated".into(),
        previous_reviewers: previous.iter().map(|u| user(u)).collect(),
        current_reviewers: current.iter().map(|u| user(u)).collect(),
        changed_by: user("alice"),
    };
    UnifiedWebhookEvent {
        provider: "gitlab".into(),
        timestamp: "2024-05-01T12:00:00Z".into(),
        actor: user("alice"),
        repository: repository(),
        merge_request: Some(merge_request()),
        payload: EventPayload::ReviewerChange(change),
    }
}

/// Write-back recorded by [`MockAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posted {
    Reply(String),
    Emoji(String),
    FullReview(String),
}

#[derive(Default)]
pub struct MockAdapter {
    bot: Option<BotIdentity>,
    /// Served by `fetch_discussion`; `None` means not found.
    pub discussion: Option<Vec<UnifiedComment>>,
    pub commits: Vec<UnifiedCommit>,
    /// Sleep before serving `fetch_merge_request_commits`.
    pub commits_delay: Option<Duration>,
    pub notes: Vec<UnifiedComment>,
    identity_calls: AtomicUsize,
    posted: Mutex<Vec<Posted>>,
}

impl MockAdapter {
    pub fn with_bot(username: &str) -> Self {
        Self {
            bot: Some(BotIdentity {
                id: "bot-1".into(),
                username: username.to_string(),
                name: "Review Bot".into(),
            }),
            ..Default::default()
        }
    }

    pub fn without_bot() -> Self {
        Self::default()
    }

    pub fn identity_calls(&self) -> usize {
        self.identity_calls.load(Ordering::SeqCst)
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.posted.lock().unwrap().clone()
    }

    fn record(&self, p: Posted) -> GitContextEngineResult<()> {
        self.posted.lock().unwrap().push(p);
        Ok(())
    }
}

#[async_trait]
impl WebhookAdapter for MockAdapter {
    fn provider_name(&self) -> &'static str {
        "gitlab"
    }

    fn can_handle(&self, _headers: &HeaderMap, _body: &[u8]) -> bool {
        false
    }

    fn event_type(&self, _headers: &HeaderMap, _body: &[u8]) -> String {
        "test".into()
    }

    fn classify(&self, _headers: &HeaderMap, _body: &[u8]) -> WebhookKind {
        WebhookKind::Unsupported
    }

    fn convert_comment_event(
        &self,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        Err(GitContextEngineWebhookError::UnsupportedEvent {
            provider: "gitlab",
            event_type: "test".into(),
        }
        .into())
    }

    fn convert_reviewer_event(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> GitContextEngineResult<UnifiedWebhookEvent> {
        self.convert_comment_event(headers, body)
    }

    async fn fetch_merge_request_commits(
        &self,
        _repo: &UnifiedRepository,
        _mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedCommit>> {
        if let Some(delay) = self.commits_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.commits.clone())
    }

    async fn fetch_merge_request_discussions(
        &self,
        _repo: &UnifiedRepository,
        _mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedDiscussion>> {
        Ok(self
            .discussion
            .iter()
            .map(|notes| UnifiedDiscussion {
                id: "d1".into(),
                notes: notes.clone(),
            })
            .collect())
    }

    async fn fetch_merge_request_notes(
        &self,
        _repo: &UnifiedRepository,
        _mr: &UnifiedMergeRequest,
    ) -> GitContextEngineResult<Vec<UnifiedComment>> {
        Ok(self.notes.clone())
    }

    async fn fetch_discussion(
        &self,
        _repo: &UnifiedRepository,
        _mr: &UnifiedMergeRequest,
        discussion_id: &str,
    ) -> GitContextEngineResult<UnifiedDiscussion> {
        match &self.discussion {
            Some(notes) => Ok(UnifiedDiscussion {
                id: discussion_id.to_string(),
                notes: notes.clone(),
            }),
            None => Err(GitContextEngineProviderError::NotFound.into()),
        }
    }

    async fn fetch_bot_identity(&self, _repo: &UnifiedRepository) -> GitContextEngineResult<BotIdentity> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        self.bot
            .clone()
            .ok_or_else(|| GitContextEngineProviderError::Unauthorized.into())
    }

    async fn post_comment_reply(&self, _event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        self.record(Posted::Reply(body.to_string()))
    }

    async fn post_emoji_reaction(&self, _event: &UnifiedWebhookEvent, emoji: &str) -> GitContextEngineResult<()> {
        self.record(Posted::Emoji(emoji.to_string()))
    }

    async fn post_full_review(&self, _event: &UnifiedWebhookEvent, body: &str) -> GitContextEngineResult<()> {
        self.record(Posted::FullReview(body.to_string()))
    }
}

pub fn file_change(path: &str, hunks: Vec<DiffHunk>) -> FileChange {
    FileChange {
        old_path: Some(path.to_string()),
        new_path: Some(path.to_string()),
        is_new: false,
        is_deleted: false,
        is_renamed: false,
        is_binary: false,
        hunks,
    }
}

/// Pure addition hunk starting at `new_start`.
pub fn hunk(new_start: u32, lines: &[&str]) -> DiffHunk {
    DiffHunk {
        old_start: new_start,
        old_lines: 0,
        new_start,
        new_lines: lines.len() as u32,
        lines: lines
            .iter()
            .enumerate()
            .map(|(i, content)| DiffLine::Added {
                new_line: new_start + i as u32,
                content: content.to_string(),
            })
            .collect(),
    }
}

/// Batch reviewer with scripted failures, output and latency.
#[derive(Default)]
pub struct MockAi {
    pub calls: AtomicUsize,
    failures_left: AtomicUsize,
    summary: String,
    comments: Vec<ReviewComment>,
    delay: Option<Duration>,
}

impl MockAi {
    pub fn ok(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self::failing_times(usize::MAX)
    }

    pub fn failing_times(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            summary: "recovered".into(),
            ..Default::default()
        }
    }

    pub fn with_line_comment(mut self, path: &str, line: u32) -> Self {
        self.comments.push(ReviewComment {
            location: Some(CommentLocation {
                file_path: path.to_string(),
                line,
                side: CommentSide::Right,
            }),
            body: format!("check line {line}"),
            severity: Severity::Warning,
            category: "bug".into(),
        });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl AiReviewer for MockAi {
    async fn review_batch(&self, _batch: &DiffBatch) -> MrResult<BatchOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::InvalidAiResponse("scripted failure".into()));
        }
        Ok(BatchOutput {
            summary: self.summary.clone(),
            comments: self.comments.clone(),
        })
    }
}

pub struct MockProvider {
    files: Vec<FileChange>,
    pub fail_posting: bool,
    posted: Mutex<Vec<ReviewComment>>,
}

impl MockProvider {
    pub fn with_files(files: Vec<FileChange>) -> Self {
        Self {
            files,
            fail_posting: false,
            posted: Mutex::new(Vec::new()),
        }
    }

    pub fn posted(&self) -> Vec<ReviewComment> {
        self.posted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    fn parse_change_request_url(&self, _url: &str) -> GitContextEngineResult<ChangeRequestId> {
        Ok(ChangeRequestId {
            project: "group/project".into(),
            iid: 42,
        })
    }

    async fn merge_request_details(&self, id: &ChangeRequestId) -> GitContextEngineResult<ChangeRequest> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        Ok(ChangeRequest {
            provider: ProviderKind::GitLab,
            id: id.clone(),
            title: "Cache parsed configuration".into(),
            description: None,
            author: AuthorInfo {
                id: "u-alice".into(),
                username: Some("alice".into()),
                name: None,
            },
            state: "opened".into(),
            web_url: MR_URL.into(),
            created_at: at,
            updated_at: at,
            source_branch: Some("feature/cache".into()),
            target_branch: Some("main".into()),
            diff_refs: DiffRefs::default(),
        })
    }

    async fn merge_request_changes(&self, _id: &ChangeRequestId) -> GitContextEngineResult<ChangeSet> {
        Ok(ChangeSet {
            files: self.files.clone(),
            is_truncated: false,
        })
    }

    async fn post_comment(&self, _meta: &ChangeRequest, comment: &ReviewComment) -> GitContextEngineResult<()> {
        if self.fail_posting {
            return Err(GitContextEngineProviderError::Server(502).into());
        }
        self.posted.lock().unwrap().push(comment.clone());
        Ok(())
    }
}

struct FixedProviders(Arc<MockProvider>);

impl ProviderFactory for FixedProviders {
    fn create_provider(&self, _settings: &ProviderSettings) -> MrResult<Arc<dyn ReviewProvider>> {
        Ok(self.0.clone())
    }
}

struct FixedAi(Arc<MockAi>);

impl AiProviderFactory for FixedAi {
    fn create_reviewer(&self, _settings: &AiSettings) -> MrResult<Arc<dyn AiReviewer>> {
        Ok(self.0.clone())
    }
}

pub fn service_with(provider: Arc<MockProvider>, ai: Arc<MockAi>, config: ReviewConfig) -> ReviewService {
    ReviewService::new(Arc::new(FixedProviders(provider)), Arc::new(FixedAi(ai)), config)
}

pub fn review_request(timeout: Option<Duration>) -> ReviewRequest {
    ReviewRequest {
        review_id: "rev-1".into(),
        url: MR_URL.into(),
        provider: ProviderSettings {
            provider_type: "gitlab".into(),
            base_url: "https://gitlab.example.com".into(),
            token: "glpat-test".into(),
        },
        ai: AiSettings {
            ai_type: "ollama".into(),
            model: "test-model".into(),
            ..Default::default()
        },
        timeout,
    }
}

pub fn tokens() -> Arc<dyn TokenStore> {
    Arc::new(StaticTokenStore::new(vec![TokenEntry {
        provider: ProviderKind::GitLab,
        instance_url: "https://gitlab.example.com".into(),
        token: "glpat-test".into(),
    }]))
}

/// Text generator replaying scripted answers and recording every prompt.
pub struct ScriptedGenerator {
    answers: Mutex<VecDeque<MrResult<String>>>,
    prompts: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedGenerator {
    pub fn new(answers: Vec<MrResult<String>>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<(String, Option<String>)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, system: Option<&str>) -> MrResult<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((prompt.to_string(), system.map(str::to_string)));
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::InvalidAiResponse("no scripted answer left".into())))
    }
}
