//! Job control
//!
//! A session has one server-side "current job" cursor: `jnew` and `job`
//! move it, `jparm` and the other job verbs act on it. Code that works on
//! a specific job goes through `with_job`, which puts the cursor back
//! afterwards whatever happens.

use log::debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::handlers::log_suppressed;
use crate::error::FaxResult;
use crate::protocol::parser::{document_path, parse_job_id, parse_submitted_job_id};
use crate::protocol::responses::{JOB_WAIT_DONE, OK, PARAMETER};
use crate::protocol::{Command, Response};
use crate::session::ProtocolSession;

/// Future returned by closures run under `with_job`.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = FaxResult<T>> + Send + 'a>>;

/// Name the server uses for its job template.
const DEFAULT_JOB: &str = "default";

impl ProtocolSession {
    /// Create a job and make it current.
    pub async fn jnew(&mut self) -> FaxResult<u64> {
        let resp = self.codec.expect(Command::Jnew, &[], &[OK]).await?;
        let id = parse_job_id(&resp.text())?;
        self.current_job = Some(id);
        Ok(id)
    }

    /// Ask the server which job is current.
    pub async fn job(&mut self) -> FaxResult<u64> {
        let resp = self.codec.expect(Command::Job, &[], &[OK]).await?;
        parse_job_id(&resp.text())
    }

    /// Make `job_id` current.
    pub async fn set_job(&mut self, job_id: u64) -> FaxResult<()> {
        let id = job_id.to_string();
        self.codec.expect(Command::Job, &[&id], &[OK]).await?;
        self.current_job = Some(job_id);
        Ok(())
    }

    /// Point the cursor back at the server's job template.
    pub async fn reset_job(&mut self) -> FaxResult<()> {
        self.codec
            .expect(Command::Job, &[DEFAULT_JOB], &[OK])
            .await?;
        self.current_job = None;
        Ok(())
    }

    /// Read a parameter of the current job.
    ///
    /// Multi-line values come back one line per entry, joined with `\n`.
    pub async fn jparm(&mut self, name: &str) -> FaxResult<String> {
        Ok(self.jparm_lines(name).await?.join("\n"))
    }

    /// Read a parameter of the current job, one entry per reply line.
    pub async fn jparm_lines(&mut self, name: &str) -> FaxResult<Vec<String>> {
        let resp = self
            .codec
            .expect(Command::Jparm, &[name], &[PARAMETER])
            .await?;
        Ok(parameter_lines(&resp))
    }

    /// Set a parameter of the current job.
    pub async fn set_jparm(&mut self, name: &str, value: &str) -> FaxResult<()> {
        self.codec
            .expect(Command::Jparm, &[name, value], &[PARAMETER, OK])
            .await?;
        Ok(())
    }

    /// Submit `job_id`, or the current job. Returns the id the server
    /// reports.
    pub async fn jsubm(&mut self, job_id: Option<u64>) -> FaxResult<u64> {
        let resp = self.job_verb(Command::Jsubm, job_id, OK).await?;
        parse_submitted_job_id(&resp.text())
    }

    pub async fn jsusp(&mut self, job_id: Option<u64>) -> FaxResult<()> {
        self.job_verb(Command::Jsusp, job_id, OK).await.map(drop)
    }

    pub async fn jkill(&mut self, job_id: Option<u64>) -> FaxResult<()> {
        self.job_verb(Command::Jkill, job_id, OK).await.map(drop)
    }

    pub async fn jintr(&mut self, job_id: Option<u64>) -> FaxResult<()> {
        self.job_verb(Command::Jintr, job_id, OK).await.map(drop)
    }

    pub async fn jdele(&mut self, job_id: Option<u64>) -> FaxResult<()> {
        self.job_verb(Command::Jdele, job_id, OK).await.map(drop)
    }

    /// Block until the job is done. Bounded by the control timeout.
    pub async fn jwait(&mut self, job_id: Option<u64>) -> FaxResult<()> {
        self.job_verb(Command::Jwait, job_id, JOB_WAIT_DONE)
            .await
            .map(drop)
    }

    /// Reset the current job's parameters to the template values.
    pub async fn jrest(&mut self) -> FaxResult<()> {
        self.codec.expect(Command::Jrest, &[], &[OK]).await?;
        Ok(())
    }

    async fn job_verb(
        &mut self,
        command: Command,
        job_id: Option<u64>,
        accepted: u16,
    ) -> FaxResult<Response> {
        let id = job_id.map(|id| id.to_string());
        let args: Vec<&str> = id.as_deref().into_iter().collect();
        self.codec.expect(command, &args, &[accepted]).await
    }

    /// Run `f` with `job_id` as the current job, then restore whatever
    /// was current before. An error from `f` wins over an error from the
    /// restore.
    pub async fn with_job<T, F>(&mut self, job_id: u64, f: F) -> FaxResult<T>
    where
        F: for<'a> FnOnce(&'a mut ProtocolSession) -> SessionFuture<'a, T>,
    {
        let previous = self.current_job;
        if previous != Some(job_id) {
            self.set_job(job_id).await?;
        }

        let result = f(self).await;

        let restore = if self.current_job == previous {
            Ok(())
        } else {
            match previous {
                Some(id) => self.set_job(id).await,
                None => self.reset_job().await,
            }
        };

        match (result, restore) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                log_suppressed("restoring job cursor", &restore_err);
                Err(e)
            }
        }
    }

    /// Resubmit the documents of `job_id` as a new job.
    ///
    /// `kill_time` becomes the new job's `lasttime` when given. Returns
    /// the new job id; the cursor ends up where it was.
    pub async fn retry(&mut self, job_id: u64, kill_time: Option<&str>) -> FaxResult<u64> {
        let kill_time = kill_time.map(str::to_string);
        self.with_job(job_id, move |session| {
            Box::pin(async move {
                let documents: Vec<String> = session
                    .jparm_lines("document")
                    .await?
                    .iter()
                    .filter_map(|line| document_path(line))
                    .map(str::to_string)
                    .collect();

                let new_id = session.jnew().await?;
                for path in &documents {
                    session.set_jparm("document", path).await?;
                }
                if let Some(kill_time) = kill_time.as_deref() {
                    session.set_jparm("lasttime", kill_time).await?;
                }
                session.jsubm(None).await?;
                debug!(
                    "Job {} retried as {} with {} document(s)",
                    job_id,
                    new_id,
                    documents.len()
                );
                Ok(new_id)
            })
        })
        .await
    }
}

/// Entries of a `213` reply. A multi-line reply lists one entry per
/// continuation line and ends with a sentinel line that is not an entry.
fn parameter_lines(resp: &Response) -> Vec<String> {
    if resp.is_multiline() {
        resp.continuation_lines()
            .into_iter()
            .map(str::to_string)
            .collect()
    } else {
        vec![resp.message().to_string()]
    }
}

/// A job reached through a shared session.
///
/// Each call locks the session and runs under `with_job`, so several
/// handles can work on one session without disturbing each other's
/// cursor.
#[derive(Clone)]
pub struct SharedJob {
    session: Arc<Mutex<ProtocolSession>>,
    job_id: u64,
}

impl SharedJob {
    /// Handle for an existing job.
    pub fn new(session: Arc<Mutex<ProtocolSession>>, job_id: u64) -> Self {
        Self { session, job_id }
    }

    /// Create a job on the server. The session's cursor is left where it
    /// was.
    pub async fn create(session: Arc<Mutex<ProtocolSession>>) -> FaxResult<Self> {
        let job_id = {
            let mut guard = session.lock().await;
            let previous = guard.current_job;
            let id = guard.jnew().await?;
            match previous {
                Some(prev) => guard.set_job(prev).await?,
                None => guard.reset_job().await?,
            }
            id
        };
        Ok(Self { session, job_id })
    }

    pub fn id(&self) -> u64 {
        self.job_id
    }

    pub async fn get(&self, name: &str) -> FaxResult<String> {
        let name = name.to_string();
        let mut session = self.session.lock().await;
        session
            .with_job(self.job_id, move |s| {
                Box::pin(async move { s.jparm(&name).await })
            })
            .await
    }

    pub async fn set(&self, name: &str, value: &str) -> FaxResult<()> {
        let (name, value) = (name.to_string(), value.to_string());
        let mut session = self.session.lock().await;
        session
            .with_job(self.job_id, move |s| {
                Box::pin(async move { s.set_jparm(&name, &value).await })
            })
            .await
    }

    pub async fn submit(&self) -> FaxResult<u64> {
        let mut session = self.session.lock().await;
        session
            .with_job(self.job_id, |s| Box::pin(s.jsubm(None)))
            .await
    }

    pub async fn suspend(&self) -> FaxResult<()> {
        let mut session = self.session.lock().await;
        session
            .with_job(self.job_id, |s| Box::pin(s.jsusp(None)))
            .await
    }

    pub async fn kill(&self) -> FaxResult<()> {
        let mut session = self.session.lock().await;
        session
            .with_job(self.job_id, |s| Box::pin(s.jkill(None)))
            .await
    }

    pub async fn wait(&self) -> FaxResult<()> {
        let mut session = self.session.lock().await;
        session
            .with_job(self.job_id, |s| Box::pin(s.jwait(None)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(lines: &[&str]) -> Response {
        Response {
            code: 213,
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn single_line_parameter_is_its_message() {
        assert_eq!(parameter_lines(&reply(&["213 5551234"])), vec!["5551234"]);
    }

    #[test]
    fn multi_line_parameter_drops_the_sentinel() {
        let resp = reply(&["213-PS docq/doc1.ps", "213-PDF docq/doc2.pdf", "213 End"]);
        let lines = parameter_lines(&resp);
        assert_eq!(lines, vec!["PS docq/doc1.ps", "PDF docq/doc2.pdf"]);
        let paths: Vec<_> = lines.iter().filter_map(|l| document_path(l)).collect();
        assert_eq!(paths, vec!["docq/doc1.ps", "docq/doc2.pdf"]);
    }
}
