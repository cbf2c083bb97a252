use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use tracing::{debug, warn};

use crate::job::{run_job, CancelFlag, JobOutcome, JobStatus, ProgressSink};
use crate::locate::FetcherHandle;
use crate::request::DownloadRequest;

/// Hard ceiling on concurrent fetcher processes, regardless of what the
/// caller asks for.
pub const MAX_BATCH_WORKERS: usize = 8;

/// Per-URL outcomes in submission order. Covers every submitted URL even
/// when individual coordinators fail unexpectedly.
#[derive(Debug)]
pub struct BatchReport {
    entries: Vec<(String, JobOutcome)>,
}

impl BatchReport {
    pub fn entries(&self) -> &[(String, JobOutcome)] {
        &self.entries
    }

    pub fn outcome(&self, url: &str) -> Option<&JobOutcome> {
        self.entries
            .iter()
            .find(|(entry_url, _)| entry_url == url)
            .map(|(_, outcome)| outcome)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, outcome)| outcome.status == JobStatus::Succeeded)
    }
}

pub(crate) fn worker_count(max_concurrency: usize, total: usize) -> usize {
    max_concurrency.clamp(1, MAX_BATCH_WORKERS).min(total.max(1))
}

/// Runs every request under a bounded pool of worker threads. Cancellation
/// is cooperative and non-atomic: running jobs get a termination request at
/// their next line-read boundary, queued jobs are never started, finished
/// jobs keep their outcome.
pub fn run_batch(
    requests: Vec<DownloadRequest>,
    max_concurrency: usize,
    fetcher: &FetcherHandle,
    media_tool: Option<&Path>,
    sink: &dyn ProgressSink,
    cancel: &CancelFlag,
) -> BatchReport {
    let total = requests.len();
    if total == 0 {
        return BatchReport {
            entries: Vec::new(),
        };
    }

    let workers = worker_count(max_concurrency, total);
    debug!(total, workers, "starting batch");

    let next = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, JobOutcome)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let completed = &completed;
            let requests = &requests;
            scope.spawn(move || loop {
                // Checked before claiming work so a canceled batch never
                // starts jobs that were still queued.
                if cancel.is_requested() {
                    break;
                }
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let req = &requests[index];

                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_job(req, fetcher, media_tool, sink, cancel)
                }))
                .unwrap_or_else(|_| {
                    warn!(url = %req.url, "job worker panicked");
                    JobOutcome {
                        status: JobStatus::Failed,
                        output_path: None,
                        log: vec!["internal error: job worker panicked".to_string()],
                    }
                });

                if tx.send((index, outcome)).is_err() {
                    break;
                }
                // Exactly one terminal transition per job feeds the
                // aggregate counter.
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                sink.batch_progress(done, total);
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<JobOutcome>> = (0..total).map(|_| None).collect();
    for (index, outcome) in rx {
        slots[index] = Some(outcome);
    }

    let entries = requests
        .into_iter()
        .zip(slots)
        .map(|(req, slot)| {
            let outcome = slot.unwrap_or_else(|| JobOutcome {
                status: JobStatus::Canceled,
                output_path: None,
                log: vec!["batch canceled before this job started".to_string()],
            });
            (req.url, outcome)
        })
        .collect();
    BatchReport { entries }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_honors_the_hard_ceiling() {
        assert_eq!(worker_count(20, 100), 8);
        assert_eq!(worker_count(20, 3), 3);
        assert_eq!(worker_count(0, 5), 1);
        assert_eq!(worker_count(4, 5), 4);
        assert_eq!(worker_count(4, 0), 1);
    }

    #[cfg(unix)]
    mod with_fake_fetcher {
        use super::*;
        use crate::progress::ProgressEvent;
        use std::path::{Path, PathBuf};
        use std::sync::Mutex;

        #[derive(Default)]
        struct BatchSink {
            events: Mutex<Vec<(String, ProgressEvent)>>,
            batch: Mutex<Vec<(usize, usize)>>,
        }

        impl ProgressSink for BatchSink {
            fn event(&self, url: &str, event: &ProgressEvent) {
                self.events
                    .lock()
                    .expect("events lock")
                    .push((url.to_string(), event.clone()));
            }

            fn batch_progress(&self, completed: usize, total: usize) {
                self.batch
                    .lock()
                    .expect("batch lock")
                    .push((completed, total));
            }
        }

        fn fake_fetcher(dir: &Path, body: &str) -> FetcherHandle {
            use std::os::unix::fs::PermissionsExt;

            let script = dir.join("fake-fetcher.sh");
            std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).expect("write script");
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
            FetcherHandle {
                program: script.to_string_lossy().to_string(),
                prefix_args: Vec::new(),
            }
        }

        fn requests(out: &Path, urls: &[&str]) -> Vec<DownloadRequest> {
            urls.iter()
                .map(|url| DownloadRequest::new(*url, out))
                .collect()
        }

        const SUCCEEDING: &str = r#"out_dir=$(dirname "$3")
id=$(printf %s "$1" | tail -c 4)
f="$out_dir/chan - $id.mp4"
printf x > "$f"
echo "[download] Destination: $f""#;

        #[test]
        fn report_covers_every_url_in_submission_order() {
            let dir = tempfile::tempdir().expect("tempdir");
            let out = dir.path().join("out");
            let fetcher = fake_fetcher(dir.path(), SUCCEEDING);
            let urls = [
                "https://example.com/watch?v=aaa1",
                "https://example.com/watch?v=bbb2",
                "https://example.com/watch?v=ccc3",
            ];

            let sink = BatchSink::default();
            let report = run_batch(
                requests(&out, &urls),
                20,
                &fetcher,
                None,
                &sink,
                &CancelFlag::new(),
            );

            assert_eq!(report.len(), 3);
            let order: Vec<&str> = report
                .entries()
                .iter()
                .map(|(url, _)| url.as_str())
                .collect();
            assert_eq!(order, urls);
            assert!(report.all_succeeded());

            // One aggregate tick per job, monotonically increasing.
            let ticks = sink.batch.lock().expect("batch");
            assert_eq!(ticks.len(), 3);
            assert_eq!(ticks.iter().map(|(done, _)| *done).max(), Some(3));
            assert!(ticks.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(ticks.iter().all(|(_, total)| *total == 3));
        }

        #[test]
        fn events_are_tagged_with_their_originating_url() {
            let dir = tempfile::tempdir().expect("tempdir");
            let out = dir.path().join("out");
            let fetcher = fake_fetcher(dir.path(), SUCCEEDING);
            let urls = [
                "https://example.com/watch?v=one1",
                "https://example.com/watch?v=two2",
            ];

            let sink = BatchSink::default();
            run_batch(
                requests(&out, &urls),
                2,
                &fetcher,
                None,
                &sink,
                &CancelFlag::new(),
            );

            let events = sink.events.lock().expect("events");
            for url in urls {
                assert!(events.iter().any(|(tag, ev)| {
                    tag == url && matches!(ev, ProgressEvent::Destination(_))
                }));
            }
        }

        #[test]
        fn failed_jobs_do_not_abort_siblings() {
            let dir = tempfile::tempdir().expect("tempdir");
            let out = dir.path().join("out");
            // Fails for one specific url, succeeds otherwise.
            let body = format!(
                r#"case "$1" in
  *bad*) echo "ERROR: boom"; exit 1 ;;
esac
{SUCCEEDING}"#
            );
            let fetcher = fake_fetcher(dir.path(), &body);
            let urls = [
                "https://example.com/watch?v=good",
                "https://example.com/watch?v=bad1",
                "https://example.com/watch?v=ok22",
            ];

            let report = run_batch(
                requests(&out, &urls),
                1,
                &fetcher,
                None,
                &crate::job::NullSink,
                &CancelFlag::new(),
            );

            assert_eq!(report.len(), 3);
            assert_eq!(
                report.outcome(urls[0]).expect("good").status,
                JobStatus::Succeeded
            );
            let bad = report.outcome(urls[1]).expect("bad");
            assert_eq!(bad.status, JobStatus::Failed);
            assert!(bad.log.iter().any(|l| l.contains("ERROR: boom")));
            assert_eq!(
                report.outcome(urls[2]).expect("ok").status,
                JobStatus::Succeeded
            );
        }

        #[test]
        fn preset_cancellation_skips_queued_jobs_but_covers_all_urls() {
            let dir = tempfile::tempdir().expect("tempdir");
            let out = dir.path().join("out");
            let fetcher = fake_fetcher(dir.path(), SUCCEEDING);
            let urls = [
                "https://example.com/watch?v=aaa1",
                "https://example.com/watch?v=bbb2",
            ];

            let cancel = CancelFlag::new();
            cancel.request();
            let report = run_batch(
                requests(&out, &urls),
                2,
                &fetcher,
                None,
                &crate::job::NullSink,
                &cancel,
            );

            assert_eq!(report.len(), 2);
            for url in urls {
                assert_eq!(
                    report.outcome(url).expect("outcome").status,
                    JobStatus::Canceled
                );
            }
            // Nothing was downloaded.
            assert!(!out.exists() || std::fs::read_dir(&out).expect("read").next().is_none());
        }

        struct CancelOnStart {
            cancel: CancelFlag,
        }

        impl ProgressSink for CancelOnStart {
            fn event(&self, _url: &str, event: &ProgressEvent) {
                // Only real process output counts, not the echoed command line.
                if matches!(event, ProgressEvent::Log(line) if line.as_str() == "started") {
                    self.cancel.request();
                }
            }
        }

        #[test]
        fn mid_run_cancellation_kills_in_flight_jobs_and_skips_queued_ones() {
            let dir = tempfile::tempdir().expect("tempdir");
            let out = dir.path().join("out");
            // Leaves a marker per started job, then hangs.
            let body = r#"out_dir=$(dirname "$3")
id=$(printf %s "$1" | tail -c 4)
touch "$out_dir/ran-$id"
echo started
sleep 600"#;
            let fetcher = fake_fetcher(dir.path(), body);
            let urls = [
                "https://example.com/watch?v=job1",
                "https://example.com/watch?v=job2",
                "https://example.com/watch?v=job3",
            ];

            let cancel = CancelFlag::new();
            let sink = CancelOnStart {
                cancel: cancel.clone(),
            };
            let started = std::time::Instant::now();
            let report = run_batch(requests(&out, &urls), 2, &fetcher, None, &sink, &cancel);
            assert!(started.elapsed() < std::time::Duration::from_secs(60));

            assert_eq!(report.len(), 3);
            for url in urls {
                assert_eq!(
                    report.outcome(url).expect("outcome").status,
                    JobStatus::Canceled
                );
            }
            // Two workers at most were in flight; the queued third job must
            // never have launched its process.
            assert!(!out.join("ran-job3").exists());
            assert!(out.join("ran-job1").exists());
        }

        #[test]
        fn empty_batch_returns_empty_report() {
            let dir = tempfile::tempdir().expect("tempdir");
            let fetcher = fake_fetcher(dir.path(), SUCCEEDING);
            let report = run_batch(
                Vec::new(),
                4,
                &fetcher,
                None,
                &crate::job::NullSink,
                &CancelFlag::new(),
            );
            assert!(report.is_empty());
            assert!(report.all_succeeded());
        }
    }
}
