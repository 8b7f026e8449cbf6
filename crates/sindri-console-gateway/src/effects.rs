//! Independent side effects triggered by one inbound message. Every job runs to completion
//! concurrently; a failing job is logged and never affects its siblings or the caller.

use crate::backend::BackendError;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use std::future::Future;
use tracing::warn;

pub struct Effects<'a> {
    scope: &'static str,
    instance_id: &'a str,
    jobs: Vec<(&'static str, BoxFuture<'a, Result<(), BackendError>>)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EffectReport {
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

impl EffectReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }

    #[cfg(test)]
    pub fn failed(&self, name: &str) -> bool {
        self.failed.iter().any(|(job, _)| *job == name)
    }
}

impl<'a> Effects<'a> {
    pub fn new(scope: &'static str, instance_id: &'a str) -> Self {
        Self {
            scope,
            instance_id,
            jobs: Vec::new(),
        }
    }

    pub fn push<F>(&mut self, name: &'static str, job: F)
    where
        F: Future<Output = Result<(), BackendError>> + Send + 'a,
    {
        self.jobs.push((name, job.boxed()));
    }

    pub async fn run(self) -> EffectReport {
        let (names, jobs): (Vec<_>, Vec<_>) = self.jobs.into_iter().unzip();
        let results = join_all(jobs).await;
        let mut report = EffectReport::default();
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(()) => report.succeeded.push(name),
                Err(err) => {
                    warn!(
                        event = "effect_failed",
                        scope = self.scope,
                        effect = name,
                        instance_id = %self.instance_id,
                        error = %err
                    );
                    report.failed.push((name, err.to_string()));
                }
            }
        }
        report
    }
}
