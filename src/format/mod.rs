//! Mail rendering for pull requests and comments.
//!
//! The formatter turns upstream records into [`Artifact`]s: complete RFC 5322
//! messages plus the watermark they represent. Rendering is pure; fetching the
//! diff and writing the message are the caller's job.
//!
//! Every message carries an `X-Bitbucket-Version` header holding its
//! watermark, so a delivered file can be matched against upstream without
//! consulting the state index (see [`read_watermark`]).

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::source::{Comment, PullRequest, User};
use crate::types::{CommentId, Watermark};

/// Header carrying the watermark of a delivered message.
pub const VERSION_HEADER: &str = "X-Bitbucket-Version";

/// Separator between a pull request description and its diff.
const DIFF_SEPARATOR: &[u8] = b"\n\n---\n\n";

/// Signature delimiter closing a pull request mail.
const SIGNATURE: &[u8] = b"-- \n";

/// A rendered message ready for delivery. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    bytes: Vec<u8>,
    watermark: Watermark,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, watermark: Watermark) -> Self {
        Artifact { bytes, watermark }
    }

    /// The complete message, headers and body.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The watermark to record once the message is delivered.
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }
}

/// Renders pull requests and comments as mail.
#[derive(Debug, Clone)]
pub struct MailFormatter {
    /// Right-hand side of generated `Message-Id`s.
    domain: String,
}

impl MailFormatter {
    pub fn new(domain: impl Into<String>) -> Self {
        MailFormatter {
            domain: domain.into(),
        }
    }

    /// Renders the mail for a pull request.
    ///
    /// The body is the description, a `---` separator, then the diff, closed
    /// by a signature delimiter.
    pub fn pull_request_mail(&self, pr: &PullRequest, diff: &[u8]) -> Artifact {
        let mut headers = Headers::default();
        headers.set("From", self.address(&pr.author.user));
        headers.set("Subject", subject(pr));
        headers.set("Date", mail_date(pr.created_date));
        headers.set("Message-Id", self.pull_request_message_id(pr));
        if let Some(link) = pr.self_link() {
            headers.set("Content-Location", link);
        }
        headers.set(VERSION_HEADER, pr.version.to_string());
        headers.set("Content-Type", "text/plain; charset=utf-8");

        let mut bytes = headers.render();
        bytes.extend_from_slice(pr.description.as_bytes());
        bytes.extend_from_slice(DIFF_SEPARATOR);
        bytes.extend_from_slice(diff);
        bytes.extend_from_slice(SIGNATURE);

        Artifact::new(bytes, pr.watermark())
    }

    /// Renders the mail for a comment on `pr`.
    ///
    /// A reply threads under `parent`; a top-level comment threads under the
    /// pull request itself.
    pub fn comment_mail(
        &self,
        pr: &PullRequest,
        comment: &Comment,
        parent: Option<&Comment>,
    ) -> Artifact {
        let root_id = self.pull_request_message_id(pr);
        let (in_reply_to, references) = match parent {
            Some(parent) => {
                let parent_id = self.comment_message_id(pr, parent.id);
                (parent_id.clone(), format!("{root_id} {parent_id}"))
            }
            None => (root_id.clone(), root_id),
        };

        let mut headers = Headers::default();
        headers.set("From", self.address(&comment.author));
        headers.set("Subject", format!("Re: {}", subject(pr)));
        headers.set("Date", mail_date(comment.created_date));
        headers.set("References", references);
        headers.set("In-Reply-To", in_reply_to);
        headers.set("Message-Id", self.comment_message_id(pr, comment.id));
        headers.set(VERSION_HEADER, comment.version.to_string());
        headers.set("Content-Type", "text/plain; charset=utf-8");

        let mut bytes = headers.render();
        bytes.extend_from_slice(comment.text.as_bytes());

        Artifact::new(bytes, comment.watermark())
    }

    /// `<id.PROJ.repo@domain>`
    pub fn pull_request_message_id(&self, pr: &PullRequest) -> String {
        let repo = pr.repo();
        format!("<{}.{}.{}@{}>", pr.id.0, repo.project, repo.slug, self.domain)
    }

    /// `<comment.pr.PROJ.repo@domain>`
    pub fn comment_message_id(&self, pr: &PullRequest, comment: CommentId) -> String {
        let repo = pr.repo();
        format!(
            "<{}.{}.{}.{}@{}>",
            comment.0, pr.id.0, repo.project, repo.slug, self.domain
        )
    }

    /// Formats a user as a mailbox. Users without an email address get a
    /// synthetic one under the message id domain.
    fn address(&self, user: &User) -> String {
        let email = match &user.email_address {
            Some(email) if !email.trim().is_empty() => email.trim().to_string(),
            _ if !user.name.is_empty() => format!("{}@{}", user.name, self.domain),
            _ => format!("noreply@{}", self.domain),
        };

        if user.display_name.is_empty() {
            format!("<{email}>")
        } else {
            format!("{} <{email}>", display_name(&user.display_name))
        }
    }
}

fn subject(pr: &PullRequest) -> String {
    let repo = pr.repo();
    format!("[{}/{} {}] {}", repo.project, repo.slug, pr.id, pr.title)
}

/// Renders epoch milliseconds as an RFC 2822 date in UTC.
fn mail_date(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .to_rfc2822()
}

/// Quotes a display name if it contains RFC 5322 specials.
fn display_name(name: &str) -> String {
    const SPECIALS: &[char] = &['(', ')', '<', '>', '[', ']', ':', ';', '@', '\\', ',', '.', '"'];

    if !name.contains(SPECIALS) {
        return name.to_string();
    }

    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Ordered header block.
#[derive(Debug, Default)]
struct Headers(Vec<(&'static str, String)>);

impl Headers {
    fn set(&mut self, name: &'static str, value: impl Into<String>) {
        self.0.push((name, sanitize(&value.into())));
    }

    fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.0 {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Replaces line breaks so an upstream value can never inject a header.
fn sanitize(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Reads the watermark recorded in a delivered message's headers.
///
/// Returns `Ok(None)` when the header is missing or not a number.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn read_watermark(path: &Path) -> io::Result<Option<Watermark>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let raw = line.trim_ascii_end();
        if raw.is_empty() {
            break;
        }
        let Some(colon) = raw.iter().position(|&b| b == b':') else {
            continue;
        };
        let (name, value) = (&raw[..colon], &raw[colon + 1..]);
        if name.trim_ascii().eq_ignore_ascii_case(VERSION_HEADER.as_bytes()) {
            let value = std::str::from_utf8(value.trim_ascii()).ok();
            return Ok(value.and_then(|v| v.parse().ok()).map(Watermark));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{comment, pull_request, with_self_link};
    use tempfile::tempdir;

    fn formatter() -> MailFormatter {
        MailFormatter::new("bitbucket.example.com")
    }

    fn text(artifact: &Artifact) -> String {
        String::from_utf8(artifact.bytes().to_vec()).unwrap()
    }

    #[test]
    fn pull_request_headers_and_body() {
        let mut pr = pull_request("PROJ", "repo", 7, 3);
        pr.title = "Add delivery".to_string();
        pr.description = "Does the thing.".to_string();
        pr.created_date = 1_700_000_000_000;

        let artifact = formatter().pull_request_mail(&pr, b"diff --git a/x b/x\n");
        let mail = text(&artifact);

        assert_eq!(artifact.watermark(), Watermark(3));
        assert!(mail.contains("Subject: [PROJ/repo #7] Add delivery\r\n"));
        assert!(mail.contains("Message-Id: <7.PROJ.repo@bitbucket.example.com>\r\n"));
        assert!(mail.contains("X-Bitbucket-Version: 3\r\n"));
        assert!(mail.contains("Date: Tue, 14 Nov 2023 22:13:20 +0000\r\n"));
        assert!(mail.ends_with("\r\n\r\nDoes the thing.\n\n---\n\ndiff --git a/x b/x\n-- \n"));
    }

    #[test]
    fn content_location_only_with_self_link() {
        let pr = pull_request("PROJ", "repo", 7, 0);
        assert!(!text(&formatter().pull_request_mail(&pr, b"")).contains("Content-Location"));

        let linked = with_self_link(pr, "https://bitbucket.example.com/pr/7");
        assert!(
            text(&formatter().pull_request_mail(&linked, b""))
                .contains("Content-Location: https://bitbucket.example.com/pr/7\r\n")
        );
    }

    #[test]
    fn top_level_comment_threads_under_pull_request() {
        let pr = pull_request("PROJ", "repo", 7, 0);
        let c = comment(11, 2, "Looks good");

        let artifact = formatter().comment_mail(&pr, &c, None);
        let mail = text(&artifact);

        assert_eq!(artifact.watermark(), Watermark(2));
        assert!(mail.contains("Subject: Re: [PROJ/repo #7] "));
        assert!(mail.contains("In-Reply-To: <7.PROJ.repo@bitbucket.example.com>\r\n"));
        assert!(mail.contains("Message-Id: <11.7.PROJ.repo@bitbucket.example.com>\r\n"));
        assert!(mail.ends_with("\r\n\r\nLooks good"));
    }

    #[test]
    fn reply_threads_under_parent_comment() {
        let pr = pull_request("PROJ", "repo", 7, 0);
        let parent = comment(11, 0, "Question?");
        let reply = comment(12, 0, "Answer.");

        let mail = text(&formatter().comment_mail(&pr, &reply, Some(&parent)));

        assert!(mail.contains("In-Reply-To: <11.7.PROJ.repo@bitbucket.example.com>\r\n"));
        assert!(mail.contains(
            "References: <7.PROJ.repo@bitbucket.example.com> <11.7.PROJ.repo@bitbucket.example.com>\r\n"
        ));
    }

    #[test]
    fn header_values_cannot_inject_headers() {
        let mut pr = pull_request("PROJ", "repo", 7, 0);
        pr.title = "evil\r\nBcc: victim@example.com".to_string();

        let mail = text(&formatter().pull_request_mail(&pr, b""));
        assert!(!mail.contains("\nBcc:"));
    }

    #[test]
    fn display_names_are_quoted_when_needed() {
        assert_eq!(display_name("Jane Doe"), "Jane Doe");
        assert_eq!(display_name("Doe, Jane"), "\"Doe, Jane\"");
        assert_eq!(display_name("J. \"JD\" Doe"), "\"J. \\\"JD\\\" Doe\"");
    }

    #[test]
    fn address_falls_back_without_email() {
        let user = User {
            name: "jdoe".to_string(),
            display_name: "Jane Doe".to_string(),
            email_address: None,
        };
        assert_eq!(
            formatter().address(&user),
            "Jane Doe <jdoe@bitbucket.example.com>"
        );
    }

    #[test]
    fn read_watermark_from_delivered_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mail");
        let pr = pull_request("PROJ", "repo", 7, 42);
        std::fs::write(&path, formatter().pull_request_mail(&pr, b"").bytes()).unwrap();

        assert_eq!(read_watermark(&path).unwrap(), Some(Watermark(42)));
    }

    #[test]
    fn read_watermark_ignores_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mail");
        std::fs::write(&path, "Subject: hi\n\nX-Bitbucket-Version: 9\n").unwrap();

        assert_eq!(read_watermark(&path).unwrap(), None);
    }

    #[test]
    fn read_watermark_skips_undecodable_headers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("msg");
        std::fs::write(&path, b"Subject: caf\xe9\r\nX-Bitbucket-Version: 4\r\n\r\nbody").unwrap();
        assert_eq!(read_watermark(&path).unwrap(), Some(Watermark(4)));

        std::fs::write(&path, b"X-Bitbucket-Version: \xff\r\n\r\n").unwrap();
        assert_eq!(read_watermark(&path).unwrap(), None);
    }

    #[test]
    fn read_watermark_tolerates_garbage_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mail");
        std::fs::write(&path, "x-bitbucket-version: soon\r\n\r\n").unwrap();

        assert_eq!(read_watermark(&path).unwrap(), None);
    }
}
