//! Demo worker: writes every record it sees to `<output-dir>/<shard>.demo`.
//!
//! Launch it from the KCL daemon's multilang properties file:
//!
//! ```text
//! executableName = shardlet-echo --output-dir /var/tmp/echo
//! ```

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use shardlet::{Checkpointer, Record, RecordProcessor, ShutdownKind, WorkerConfig};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run { output_dir: PathBuf },
    Help,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let output_dir = match parse_args(&args) {
        Ok(Command::Run { output_dir }) => output_dir,
        Ok(Command::Help) => {
            print_usage();
            return;
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            print_usage();
            process::exit(2);
        }
    };

    shardlet::telemetry::init_tracing();

    if let Err(e) = run(output_dir) {
        tracing::error!(error = %format!("{e:#}"), "shardlet-echo failed");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Usage: shardlet-echo [--output-dir <dir>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --output-dir <dir>  Where <shard>.demo files are written");
    eprintln!("                      [default: system temp dir]");
    eprintln!("  -h, --help          Print this help");
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    let mut output_dir = std::env::temp_dir();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--output-dir" => {
                i += 1;
                output_dir = PathBuf::from(args.get(i).ok_or("--output-dir requires a value")?);
            }
            "--help" | "-h" => return Ok(Command::Help),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(Command::Run { output_dir })
}

fn run(output_dir: PathBuf) -> anyhow::Result<()> {
    // One shard, one control flow: no need for more than one thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let mut processor = EchoProcessor::new(output_dir);
    runtime.block_on(shardlet::run_worker(&mut processor, WorkerConfig::from_env()))?;
    Ok(())
}

struct EchoProcessor {
    output_dir: PathBuf,
    out: Option<File>,
}

impl EchoProcessor {
    fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            out: None,
        }
    }

    fn demo_path(dir: &Path, shard_id: &str) -> PathBuf {
        dir.join(format!("{shard_id}.demo"))
    }

    async fn write_line(&mut self, line: String) -> anyhow::Result<()> {
        let out = self.out.as_mut().context("output file not open")?;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    async fn checkpoint(checkpointer: &mut Checkpointer) {
        // A rejected checkpoint is retried implicitly by the next batch.
        if let Err(e) = checkpointer.checkpoint_all().await {
            tracing::warn!(error = %e, "Checkpoint failed");
        }
    }
}

#[async_trait::async_trait]
impl RecordProcessor for EchoProcessor {
    async fn initialize(&mut self, shard_id: &str) -> anyhow::Result<()> {
        let path = Self::demo_path(&self.output_dir, shard_id);
        let file = File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        tracing::info!(path = %path.display(), "Echoing records");

        self.out = Some(file);
        self.write_line(format!("init: {shard_id}\n")).await
    }

    async fn process_records(
        &mut self,
        records: Vec<Record>,
        checkpointer: &mut Checkpointer,
    ) -> anyhow::Result<()> {
        for record in &records {
            self.write_line(format!("process: {}\n", record.data)).await?;
        }
        Self::checkpoint(checkpointer).await;
        Ok(())
    }

    async fn shutdown(
        &mut self,
        kind: ShutdownKind,
        checkpointer: &mut Checkpointer,
    ) -> anyhow::Result<()> {
        self.write_line(format!("shutdown: {kind}\n")).await?;
        if kind.allows_checkpoint() {
            Self::checkpoint(checkpointer).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlet::Worker;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("shardlet-echo")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_to_temp_dir() {
        assert_eq!(
            parse_args(&args(&[])),
            Ok(Command::Run {
                output_dir: std::env::temp_dir()
            })
        );
    }

    #[test]
    fn parses_output_dir() {
        assert_eq!(
            parse_args(&args(&["--output-dir", "/var/tmp/echo"])),
            Ok(Command::Run {
                output_dir: PathBuf::from("/var/tmp/echo")
            })
        );
    }

    #[test]
    fn help_and_usage_errors() {
        assert_eq!(parse_args(&args(&["-h"])), Ok(Command::Help));
        assert_eq!(parse_args(&args(&["--help"])), Ok(Command::Help));
        assert_eq!(
            parse_args(&args(&["--output-dir"])),
            Err("--output-dir requires a value".to_string())
        );
        assert_eq!(
            parse_args(&args(&["--verbose"])),
            Err("unknown flag: --verbose".to_string())
        );
        assert_eq!(
            parse_args(&args(&["extra"])),
            Err("unexpected argument: extra".to_string())
        );
    }

    async fn run_session(dir: &Path, input: &str) -> (Result<(), shardlet::WorkerError>, String) {
        let (writer, mut output) = tokio::io::duplex(64 * 1024);
        let worker = Worker::new(
            Cursor::new(input.as_bytes().to_vec()),
            writer,
            &WorkerConfig::default(),
        );
        let mut processor = EchoProcessor::new(dir.to_path_buf());
        let result = worker.run(&mut processor).await;
        drop(processor);

        let mut written = String::new();
        output.read_to_string(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn echoes_records_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let input = concat!(
            "{\"action\":\"initialize\",\"shardId\":\"shardId-000000000001\"}\n",
            "{\"action\":\"processRecords\",\"records\":[",
            "{\"data\":\"aGVsbG8=\",\"partitionKey\":\"a\",\"sequenceNumber\":\"1\"},",
            "{\"data\":\"d29ybGQ=\",\"partitionKey\":\"b\",\"sequenceNumber\":\"2\"}]}\n",
            "{\"action\":\"checkpoint\"}\n",
            "{\"action\":\"shutdown\",\"reason\":\"TERMINATE\"}\n",
            "{\"action\":\"checkpoint\"}\n",
        );

        let (result, written) = run_session(dir.path(), input).await;

        assert!(result.is_ok(), "{result:?}");
        assert_eq!(
            written,
            concat!(
                "{\"action\":\"status\",\"responseFor\":\"initialize\"}\n",
                "{\"action\":\"checkpoint\",\"checkpoint\":null}\n",
                "{\"action\":\"status\",\"responseFor\":\"processRecords\"}\n",
                "{\"action\":\"checkpoint\",\"checkpoint\":null}\n",
            )
        );

        let demo = std::fs::read_to_string(dir.path().join("shardId-000000000001.demo")).unwrap();
        assert_eq!(
            demo,
            "init: shardId-000000000001\nprocess: aGVsbG8=\nprocess: d29ybGQ=\nshutdown: graceful\n"
        );
    }

    #[tokio::test]
    async fn zombie_shutdown_skips_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let input = concat!(
            "{\"action\":\"initialize\",\"shardId\":\"s\"}\n",
            "{\"action\":\"shutdown\",\"reason\":\"ZOMBIE\"}\n",
        );

        let (result, written) = run_session(dir.path(), input).await;

        assert!(result.is_ok(), "{result:?}");
        assert_eq!(written, "{\"action\":\"status\",\"responseFor\":\"initialize\"}\n");
        let demo = std::fs::read_to_string(dir.path().join("s.demo")).unwrap();
        assert_eq!(demo, "init: s\nshutdown: zombie\n");
    }

    #[tokio::test]
    async fn rejected_checkpoint_does_not_fail_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let input = concat!(
            "{\"action\":\"initialize\",\"shardId\":\"s\"}\n",
            "{\"action\":\"processRecords\",\"records\":[]}\n",
            "{\"action\":\"checkpoint\",\"error\":\"ThrottlingException\"}\n",
            "{\"action\":\"shutdown\",\"reason\":\"ZOMBIE\"}\n",
        );

        let (result, written) = run_session(dir.path(), input).await;

        assert!(result.is_ok(), "{result:?}");
        assert!(written.ends_with("{\"action\":\"status\",\"responseFor\":\"processRecords\"}\n"));
    }

    #[tokio::test]
    async fn unwritable_output_dir_fails_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let input = "{\"action\":\"initialize\",\"shardId\":\"s\"}\n";

        let (result, written) = run_session(&missing, input).await;

        assert!(matches!(
            result,
            Err(shardlet::WorkerError::Processor { action: "initialize", .. })
        ));
        assert_eq!(written, "");
    }
}
