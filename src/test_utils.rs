//! Shared test utilities and arbitrary generators for property-based testing.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use proptest::prelude::*;

use crate::maildir::{EscapedHostname, Maildir, UniqueNameGenerator};
use crate::source::types::{COMMENTED, Link, Participant, Project, Ref, Repository};
use crate::source::{
    Activity, Comment, PullRequest, PullRequestSource, Result as SourceResult, SourceError, User,
};
use crate::types::{CommentId, DeliveryKey, PrId, ProjectKey, RepoId, RepoSlug};

pub fn arb_pr_id() -> impl Strategy<Value = PrId> {
    any::<u64>().prop_map(PrId)
}

pub fn arb_comment_id() -> impl Strategy<Value = CommentId> {
    any::<u64>().prop_map(CommentId)
}

pub fn arb_repo_id() -> impl Strategy<Value = RepoId> {
    ("[A-Z][A-Z0-9_]{0,9}", "[a-z][a-z0-9_-]{0,20}").prop_map(|(p, s)| RepoId::new(p, s))
}

pub fn arb_delivery_key() -> impl Strategy<Value = DeliveryKey> {
    prop_oneof![
        (arb_repo_id(), arb_pr_id()).prop_map(|(r, p)| DeliveryKey::pull_request(&r, p).unwrap()),
        (arb_repo_id(), arb_pr_id(), arb_comment_id())
            .prop_map(|(r, p, c)| DeliveryKey::comment(&r, p, c).unwrap()),
    ]
}

// ─── Mailbox helpers ───

/// Opens a mailbox at `root` whose names use a fixed fake hostname.
pub fn test_maildir(root: &Path) -> Maildir {
    let names = UniqueNameGenerator::new(Box::new(EscapedHostname::new("test")));
    Maildir::open(root, names).unwrap()
}

/// Every published message in `new` and `cur`, sorted.
pub fn published_files(maildir: &Maildir) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = [maildir.new_dir(), maildir.cur_dir()]
        .iter()
        .flat_map(|dir| fs::read_dir(dir).unwrap())
        .map(|entry| entry.unwrap().path())
        .collect();
    files.sort();
    files
}

/// Number of files in the staging directory.
pub fn staging_count(maildir: &Maildir) -> usize {
    fs::read_dir(maildir.tmp_dir()).unwrap().count()
}

// ─── Upstream record builders ───

pub fn user(display_name: &str) -> User {
    User {
        name: display_name.to_lowercase().replace(' ', "."),
        display_name: display_name.to_string(),
        email_address: None,
    }
}

pub fn pull_request(project: &str, slug: &str, id: u64, version: u64) -> PullRequest {
    PullRequest {
        id: PrId(id),
        version,
        created_date: 1_700_000_000_000,
        title: format!("Pull request {id}"),
        description: String::new(),
        author: Participant {
            user: user("Jane Doe"),
        },
        to_ref: Ref {
            repository: Repository {
                slug: RepoSlug::new(slug),
                project: Project {
                    key: ProjectKey::new(project),
                },
            },
        },
        links: HashMap::new(),
    }
}

pub fn with_self_link(mut pr: PullRequest, href: &str) -> PullRequest {
    pr.links.insert(
        "self".to_string(),
        vec![Link {
            href: href.to_string(),
        }],
    );
    pr
}

pub fn comment(id: u64, version: u64, text: &str) -> Comment {
    Comment {
        id: CommentId(id),
        version,
        text: text.to_string(),
        author: user("Reviewer"),
        created_date: 1_700_000_100_000,
        comments: Vec::new(),
    }
}

pub fn reply_to(mut parent: Comment, reply: Comment) -> Comment {
    parent.comments.push(reply);
    parent
}

/// A `COMMENTED` activity carrying `comment`.
pub fn commented(activity_id: u64, comment: Comment) -> Activity {
    Activity {
        id: activity_id,
        created_date: comment.created_date,
        action: COMMENTED.to_string(),
        comment: Some(comment),
    }
}

/// An activity that carries no comment.
pub fn approved(activity_id: u64) -> Activity {
    Activity {
        id: activity_id,
        created_date: 1_700_000_200_000,
        action: "APPROVED".to_string(),
        comment: None,
    }
}

// ─── Fake source ───

#[derive(Debug, Default)]
struct FakeState {
    pull_requests: Vec<PullRequest>,
    activities: HashMap<PrId, Vec<Activity>>,
    diffs: HashMap<PrId, Vec<u8>>,
    fail_enumeration: bool,
    failing_diffs: HashSet<PrId>,
    failing_activities: HashSet<PrId>,
    diff_calls: usize,
}

/// In-memory [`PullRequestSource`] whose upstream state tests can change
/// between runs.
#[derive(Debug, Default)]
pub struct FakeSource {
    state: RefCell<FakeState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `pr`, or replaces the pull request with the same id.
    pub fn put_pull_request(&self, pr: PullRequest) {
        let mut state = self.state.borrow_mut();
        match state.pull_requests.iter_mut().find(|p| p.id == pr.id) {
            Some(existing) => *existing = pr,
            None => state.pull_requests.push(pr),
        }
    }

    pub fn set_activities(&self, pr: PrId, activities: Vec<Activity>) {
        self.state.borrow_mut().activities.insert(pr, activities);
    }

    pub fn set_diff(&self, pr: PrId, diff: &[u8]) {
        self.state.borrow_mut().diffs.insert(pr, diff.to_vec());
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state.borrow_mut().fail_enumeration = fail;
    }

    pub fn fail_diff(&self, pr: PrId, fail: bool) {
        let mut state = self.state.borrow_mut();
        if fail {
            state.failing_diffs.insert(pr);
        } else {
            state.failing_diffs.remove(&pr);
        }
    }

    pub fn fail_activities(&self, pr: PrId, fail: bool) {
        let mut state = self.state.borrow_mut();
        if fail {
            state.failing_activities.insert(pr);
        } else {
            state.failing_activities.remove(&pr);
        }
    }

    /// Number of diffs fetched so far.
    pub fn diff_calls(&self) -> usize {
        self.state.borrow().diff_calls
    }
}

fn injected(what: &str) -> SourceError {
    SourceError::Transport(format!("injected {what} failure"))
}

impl PullRequestSource for FakeSource {
    fn pull_requests(&self) -> SourceResult<Vec<PullRequest>> {
        let state = self.state.borrow();
        if state.fail_enumeration {
            return Err(injected("enumeration"));
        }
        Ok(state.pull_requests.clone())
    }

    fn activities(&self, pr: &PullRequest) -> SourceResult<Vec<Activity>> {
        let state = self.state.borrow();
        if state.failing_activities.contains(&pr.id) {
            return Err(injected("activities"));
        }
        Ok(state.activities.get(&pr.id).cloned().unwrap_or_default())
    }

    fn diff(&self, pr: &PullRequest) -> SourceResult<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        state.diff_calls += 1;
        if state.failing_diffs.contains(&pr.id) {
            return Err(injected("diff"));
        }
        Ok(state
            .diffs
            .get(&pr.id)
            .cloned()
            .unwrap_or_else(|| format!("diff for {}\n", pr.id).into_bytes()))
    }
}
