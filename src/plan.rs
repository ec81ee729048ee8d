//! Conversion plans.
//!
//! A plan is the manifest of one `(tenant, day)`: a header line, one JSON
//! line per series with the chunk ids that materialize it, and a footer
//! marking the plan as completely written. Discovering and leasing plans
//! is the supervisor's job; this module only parses them and feeds their
//! entries into the build pipeline.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{bail, format_err, Error};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// First line of a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHeader {
    pub tenant: String,
    pub day: NaiveDate,
}

/// One series to build: its id and the chunks materializing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub series_id: String,
    pub chunks: Vec<String>,
}

/// Last line of a plan file. A plan without it was cut short by whatever
/// produced it and must not be built.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanFooter {
    complete: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanLine {
    Entry(PlanEntry),
    Footer(PlanFooter),
}

/// A fully parsed plan.
#[derive(Debug, Clone)]
pub struct Plan {
    pub header: PlanHeader,
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn read<R: Read>(reader: R) -> Result<Self, Error> {
        let mut lines = BufReader::new(reader).lines();

        let header_line = lines
            .next()
            .ok_or_else(|| format_err!("plan is empty"))??;
        let header: PlanHeader = serde_json::from_str(&header_line)
            .map_err(|err| format_err!("unable to parse plan header - {}", err))?;

        let mut entries = Vec::new();
        let mut complete = false;
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if complete {
                bail!("unexpected data after plan footer");
            }
            match serde_json::from_str(&line)
                .map_err(|err| format_err!("unable to parse plan line - {}", err))?
            {
                PlanLine::Entry(entry) => entries.push(entry),
                PlanLine::Footer(footer) => {
                    if !footer.complete {
                        bail!("plan footer marks the plan as incomplete");
                    }
                    complete = true;
                }
            }
        }
        if !complete {
            bail!("plan has no footer, it was not completely written");
        }

        Ok(Self { header, entries })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = std::fs::File::open(path)
            .map_err(|err| format_err!("unable to open plan {:?} - {}", path, err))?;
        Self::read(file).map_err(|err| format_err!("invalid plan {:?} - {}", path, err))
    }

    /// Feed the entries into a bounded channel for the build pipeline.
    pub fn into_channel(self, buffer: usize) -> (PlanHeader, mpsc::Receiver<PlanEntry>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let entries = self.entries;
        tokio::spawn(async move {
            for entry in entries {
                if tx.send(entry).await.is_err() {
                    break; // receiver hung up, the build failed
                }
            }
        });
        (self.header, rx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PLAN: &str = concat!(
        "{\"tenant\":\"tenant-1\",\"day\":\"2020-06-15\"}\n",
        "{\"series_id\":\"s1\",\"chunks\":[\"c1\",\"c2\"]}\n",
        "{\"series_id\":\"s2\",\"chunks\":[\"c3\"]}\n",
        "{\"complete\":true}\n",
    );

    #[test]
    fn plans_parse() {
        let plan = Plan::read(PLAN.as_bytes()).unwrap();
        assert_eq!(plan.header.tenant, "tenant-1");
        assert_eq!(
            plan.header.day,
            NaiveDate::from_ymd_opt(2020, 6, 15).unwrap()
        );
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[1].chunks, vec!["c3"]);
    }

    #[test]
    fn truncated_plan_is_rejected() {
        let truncated = &PLAN[..PLAN.len() - 18];
        let err = Plan::read(truncated.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("footer"), "{}", err);
    }

    #[test]
    fn data_after_footer_is_rejected() {
        let mut text = PLAN.to_string();
        text.push_str("{\"series_id\":\"s3\",\"chunks\":[]}\n");
        let err = Plan::read(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("after plan footer"), "{}", err);
    }

    #[tokio::test]
    async fn channel_preserves_entry_order() {
        let plan = Plan::read(PLAN.as_bytes()).unwrap();
        let (header, mut rx) = plan.into_channel(1);
        assert_eq!(header.tenant, "tenant-1");
        assert_eq!(rx.recv().await.unwrap().series_id, "s1");
        assert_eq!(rx.recv().await.unwrap().series_id, "s2");
        assert!(rx.recv().await.is_none());
    }
}
