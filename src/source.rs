use crate::models::Exam;
use anyhow::Context;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use tracing::info;

static EXAM_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("static regex"));

/// Where exam definitions come from when they are not registered directly.
pub trait ExamSource: Send + Sync {
    fn fetch_exam(&self, exam_id: &str) -> BoxFuture<'static, anyhow::Result<Option<Exam>>>;
}

#[derive(Clone)]
pub struct NoExamSource;

impl ExamSource for NoExamSource {
    fn fetch_exam(&self, _exam_id: &str) -> BoxFuture<'static, anyhow::Result<Option<Exam>>> {
        Box::pin(async { Ok(None) })
    }
}

/// Reads `<dir>/<exam_id>.json`.
#[derive(Clone)]
pub struct DirectoryExamSource {
    pub dir: PathBuf,
}

impl DirectoryExamSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ExamSource for DirectoryExamSource {
    fn fetch_exam(&self, exam_id: &str) -> BoxFuture<'static, anyhow::Result<Option<Exam>>> {
        let dir = self.dir.clone();
        let exam_id = exam_id.to_string();
        Box::pin(async move {
            if !EXAM_ID.is_match(&exam_id) || exam_id.contains("..") {
                return Ok(None);
            }
            let path = dir.join(format!("{exam_id}.json"));
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
            };
            let exam: Exam = serde_json::from_str(&raw)
                .with_context(|| format!("parsing exam definition {}", path.display()))?;
            if exam.id != exam_id {
                anyhow::bail!("exam file {} declares id '{}'", path.display(), exam.id);
            }
            info!(exam_id = %exam_id, "loaded exam definition from {}", path.display());
            Ok(Some(exam))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_source_reads_and_rejects() {
        let dir = std::env::temp_dir().join(format!("exam-defs-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("sat-1.json"),
            r#"{"id": "sat-1", "title": "SAT", "sections": []}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("renamed.json"), r#"{"id": "other"}"#).await.unwrap();

        let source = DirectoryExamSource::new(&dir);
        let exam = source.fetch_exam("sat-1").await.unwrap().unwrap();
        assert_eq!(exam.title, "SAT");
        assert!(source.fetch_exam("missing").await.unwrap().is_none());
        assert!(source.fetch_exam("../etc/passwd").await.unwrap().is_none());
        assert!(source.fetch_exam("renamed").await.is_err());
        assert!(NoExamSource.fetch_exam("sat-1").await.unwrap().is_none());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
