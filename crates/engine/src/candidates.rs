//! Candidate file ingestion
//!
//! The analysis stage drops one CSV per trading day into the candidate
//! directory. The engine picks the newest file for today, filters rows by
//! verdict and score, and orders the survivors by combined score so the
//! strongest suggestions get capital first.

use chrono::{DateTime, Local, NaiveDate, Utc};
use neodip_core::errors::{Error, Result};
use neodip_core::models::{Candidate, Verdict};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Pick the newest candidate CSV written today, if any
pub fn newest_candidate_file(dir: &Path, today: NaiveDate) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Persistence(e.to_string())),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let modified_day = DateTime::<Utc>::from(modified)
            .with_timezone(&Local)
            .date_naive();
        if modified_day != today {
            continue;
        }
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Parse, filter, and rank a candidate file.
///
/// Rows that fail the verdict/score gate are dropped silently; rows that
/// fail to parse are logged and skipped so one bad line cannot sink the
/// whole trading day. Duplicate tickers keep the higher-scoring row.
pub fn load_candidates(path: &Path, min_combined_score: f64) -> Result<Vec<Candidate>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| Error::InvalidData(format!("{}: {}", path.display(), e)))?;

    let mut by_ticker: HashMap<String, Candidate> = HashMap::new();
    let mut parsed = 0usize;
    for (line, record) in reader.deserialize::<CandidateRow>().enumerate() {
        let row = match record {
            Ok(row) => row,
            Err(e) => {
                warn!("{}: row {} unparseable, skipping: {}", path.display(), line + 2, e);
                continue;
            }
        };
        parsed += 1;
        let Some(candidate) = row.into_candidate() else {
            continue;
        };
        if !candidate.accepted(min_combined_score) {
            continue;
        }
        by_ticker
            .entry(candidate.ticker.to_uppercase())
            .and_modify(|existing| {
                if candidate.combined_score > existing.combined_score {
                    *existing = candidate.clone();
                }
            })
            .or_insert(candidate);
    }

    let mut candidates: Vec<Candidate> = by_ticker.into_values().collect();
    candidates.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    info!(
        "{}: {} rows parsed, {} accepted",
        path.display(),
        parsed,
        candidates.len()
    );
    Ok(candidates)
}

/// Today's candidates, or empty when the analysis stage produced nothing
pub fn load_today(dir: &Path, min_combined_score: f64) -> Result<Vec<Candidate>> {
    let today = Local::now().date_naive();
    match newest_candidate_file(dir, today)? {
        Some(path) => load_candidates(&path, min_combined_score),
        None => {
            debug!("no candidate file for {} in {}", today, dir.display());
            Ok(Vec::new())
        }
    }
}

/// Raw CSV row; verdict arrives as free text
#[derive(Debug, serde::Deserialize)]
struct CandidateRow {
    ticker: String,
    last_close: f64,
    final_verdict: String,
    combined_score: f64,
    #[serde(default)]
    execution_capital: Option<f64>,
}

impl CandidateRow {
    fn into_candidate(self) -> Option<Candidate> {
        let verdict = Verdict::parse_lenient(&self.final_verdict)?;
        let ticker = self.ticker.trim().to_uppercase();
        if ticker.is_empty() || self.last_close <= 0.0 {
            return None;
        }
        Some(Candidate {
            ticker,
            last_close: self.last_close,
            final_verdict: verdict,
            combined_score: self.combined_score,
            execution_capital: self.execution_capital.filter(|c| *c > 0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "ticker,last_close,final_verdict,combined_score,execution_capital"
        )
        .unwrap();
        write!(file, "{}", body).unwrap();
        path
    }

    #[test]
    fn filters_verdicts_and_scores() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "candidates.csv",
            "RELIANCE,2450.50,buy,42.0,100000\n\
             TCS,4000.0,watch,55.0,\n\
             INFY,1500.0,strong_buy,24.9,\n\
             SBIN,800.0,strong buy,31.5,\n\
             BAD,0.0,buy,40.0,\n",
        );
        let candidates = load_candidates(&path, 25.0).unwrap();
        let tickers: Vec<&str> = candidates.iter().map(|c| c.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["RELIANCE", "SBIN"]);
    }

    #[test]
    fn ranks_by_combined_score_descending() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "candidates.csv",
            "A,100.0,buy,30.0,\nB,100.0,buy,60.0,\nC,100.0,buy,45.0,\n",
        );
        let candidates = load_candidates(&path, 25.0).unwrap();
        let tickers: Vec<&str> = candidates.iter().map(|c| c.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["B", "C", "A"]);
    }

    #[test]
    fn duplicate_tickers_keep_the_stronger_row() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "candidates.csv",
            "RELIANCE,2450.0,buy,30.0,\nreliance,2455.0,strong_buy,50.0,\n",
        );
        let candidates = load_candidates(&path, 25.0).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].combined_score, 50.0);
    }

    #[test]
    fn unparseable_rows_do_not_sink_the_file() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "candidates.csv",
            "RELIANCE,2450.50,buy,42.0,100000\nnot,a,valid,row\n",
        );
        let candidates = load_candidates(&path, 25.0).unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn newest_file_today_wins() {
        let dir = tempdir().unwrap();
        write_csv(dir.path(), "candidates_a.csv", "A,100.0,buy,30.0,\n");
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newer = write_csv(dir.path(), "candidates_b.csv", "B,100.0,buy,30.0,\n");

        let today = Local::now().date_naive();
        let picked = newest_candidate_file(dir.path(), today).unwrap().unwrap();
        assert_eq!(picked, newer);

        // nothing for another day
        let tomorrow = today.succ_opt().unwrap();
        assert!(newest_candidate_file(dir.path(), tomorrow)
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_directory_is_empty_not_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(newest_candidate_file(&missing, Local::now().date_naive())
            .unwrap()
            .is_none());
    }
}
