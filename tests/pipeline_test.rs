use anyhow::Result;
use nick_aggregator::artifact;
use nick_aggregator::config::AggregatorConfig;
use nick_aggregator::constants::{NICK_COLUMN, ORIGINAL_COLUMN};
use nick_aggregator::dedupe::{self, DedupeMode};
use nick_aggregator::export::{ExportFormat, Partition};
use nick_aggregator::orchestrator::Orchestrator;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn local_source(root: &Path, slug: &str, file: &str, content: &str, extra: &str) -> Result<String> {
    let dir = root.join("inputs").join(slug);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join(file), content)?;
    Ok(format!(
        "\n[[sources]]\nslug = \"{}\"\nkind = \"local\"\npath = \"{}\"\n{}\n",
        slug,
        dir.display(),
        extra
    ))
}

fn config(root: &Path, sources: &[String]) -> Result<AggregatorConfig> {
    let mut toml = format!(
        "[defaults]\ncache_dir = \"{}\"\nsplit_max_lines = 3\nfinal_chunk_lines = 2\n",
        root.join("data/raw").display()
    );
    for source in sources {
        toml.push_str(source);
    }
    Ok(AggregatorConfig::from_toml(&toml)?)
}

#[tokio::test]
async fn test_first_declared_source_wins_original() -> Result<()> {
    let dir = tempdir()?;
    let sources = vec![
        local_source(dir.path(), "source_a", "a.txt", "Alice\nbob\nalice\n", "keep_original = true")?,
        local_source(dir.path(), "source_b", "b.txt", "ALICE\ncarol\n", "keep_original = true")?,
    ];
    let mut orch = Orchestrator::new(config(dir.path(), &sources)?, false)?;

    let report = orch.deduplicate(DedupeMode::Full).await?;
    assert_eq!(artifact::read_column(&report.path, NICK_COLUMN)?, vec!["alice", "bob", "carol"]);
    assert_eq!(artifact::read_column(&report.path, ORIGINAL_COLUMN)?, vec!["Alice", "bob", "carol"]);

    let summary = orch.export(ExportFormat::Original, None).await?;
    let (_, rows) = artifact::read_rows(&summary.files[0])?;
    assert_eq!(rows[0], vec!["alice", "Alice"]);
    Ok(())
}

#[tokio::test]
async fn test_chunk_dedupe_keeps_first_seen_order() -> Result<()> {
    let dir = tempdir()?;
    let chunks = dir.path().join("splits");
    fs::create_dir_all(&chunks)?;
    fs::write(chunks.join("chunk_001.txt"), "x\ny\nx\n")?;
    fs::write(chunks.join("chunk_002.txt"), "y\nz\n")?;

    let output = dir.path().join("deduped_chunks.txt");
    let report = dedupe::deduplicate_chunks(&chunks, &output, false, None)?;
    assert_eq!(report.unique, 3);
    assert_eq!(fs::read_to_string(&output)?, "x\ny\nz\n");
    Ok(())
}

#[tokio::test]
async fn test_full_local_pipeline_over_mixed_formats() -> Result<()> {
    let dir = tempdir()?;
    let sources = vec![
        local_source(dir.path(), "players", "players.csv", "id,Username\n1,Steve\n2,Élodie\n3,steve\n", "")?,
        local_source(
            dir.path(),
            "profiles",
            "profiles.json",
            r#"[{"handle": "Zoë", "age": 3}, {"handle": "Mike  Smith"}, {"handle": null}]"#,
            "",
        )?,
        local_source(
            dir.path(),
            "mails",
            "list.txt",
            "Steve@mail.com\nnew.user@x.org\n",
            "is_email = true",
        )?,
    ];
    let mut orch = Orchestrator::new(config(dir.path(), &sources)?, false)?;

    let stats = orch.run_automated(None).await?;
    assert_eq!(stats.sources_downloaded, 3);
    assert_eq!(stats.entries_deduped, 5);

    let layout = orch.layout().clone();
    let nicknames = fs::read_to_string(layout.partition_dir("nicknames").join("nicknames.txt"))?;
    assert_eq!(nicknames, "steve\nelodie\nzoe\nmike smith\nnew.user\n");
    let passwords = fs::read_to_string(layout.partition_dir("passwords").join("passwords.txt"))?;
    assert_eq!(passwords, "new.user\n");

    // Three-line split chunks are lossless
    let splits: String = dedupe::list_chunks(&layout.splits)?
        .iter()
        .map(fs::read_to_string)
        .collect::<std::io::Result<_>>()?;
    assert_eq!(splits, "steve\nelodie\nzoe\nmike smith\nsteve\nnew.user\n");

    // Emails are only exported on request and come from the email table
    let summary = orch.export(ExportFormat::Emails, None).await?;
    assert!(!summary.files.is_empty());
    let emails = fs::read_to_string(layout.partition_dir("emails").join("emails.txt"))?;
    assert_eq!(emails, "steve@mail.com\nnew.user@x.org\n");

    // A second run reuses every cached artifact
    let mut again = Orchestrator::new(config(dir.path(), &sources)?, false)?;
    let report = again.normalize().await?;
    assert!(report.artifacts.iter().all(|a| a.reused));
    Ok(())
}

#[tokio::test]
async fn test_partition_only_run_writes_single_partition() -> Result<()> {
    let dir = tempdir()?;
    let sources = vec![local_source(dir.path(), "words", "w.txt", "hunter2\nletmein99\n", "")?];
    let mut orch = Orchestrator::new(config(dir.path(), &sources)?, false)?;
    orch.run_automated(Some(Partition::Passwords)).await?;

    let layout = orch.layout();
    assert!(layout.partition_dir("passwords").join("passwords.txt").exists());
    assert!(!layout.partition_dir("nicknames").join("nicknames.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_dedupe_modes_agree_on_the_value_set() -> Result<()> {
    let dir = tempdir()?;
    let sources = vec![
        local_source(dir.path(), "one", "1.txt", "a\nb\nc\nb\n", "")?,
        local_source(dir.path(), "two", "2.txt", "c\nd\na\n", "")?,
    ];
    let cfg = config(dir.path(), &sources)?;

    let mut full = Orchestrator::new(cfg.clone(), true)?;
    let full_report = full.deduplicate(DedupeMode::Full).await?;
    let full_values: BTreeSet<String> = artifact::read_column(&full_report.path, NICK_COLUMN)?.into_iter().collect();

    let mut high = Orchestrator::new(cfg.clone(), true)?;
    let high_report = high.deduplicate(DedupeMode::HighVolume).await?;
    let high_values: BTreeSet<String> = artifact::read_column(&high_report.path, NICK_COLUMN)?.into_iter().collect();

    let mut chunked = Orchestrator::new(cfg, true)?;
    chunked.normalize().await?;
    chunked.split_normalized(None).await?;
    let chunk_report = chunked.deduplicate(DedupeMode::Chunks).await?;
    let chunk_values: BTreeSet<String> = fs::read_to_string(&chunk_report.path)?.lines().map(str::to_string).collect();

    let expected: BTreeSet<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
    assert_eq!(full_values, expected);
    assert_eq!(high_values, expected);
    assert_eq!(chunk_values, expected);
    Ok(())
}

#[tokio::test]
async fn test_final_export_only_last_line_lacks_comma() -> Result<()> {
    let dir = tempdir()?;
    let sources = vec![local_source(dir.path(), "letters", "l.txt", "a\nb\nc\nD\ne\nb\n", "")?];
    let mut orch = Orchestrator::new(config(dir.path(), &sources)?, false)?;
    orch.normalize().await?;
    orch.split_normalized(None).await?;
    orch.deduplicate(DedupeMode::Chunks).await?;

    let summary = orch.export(ExportFormat::Final, None).await?;
    assert_eq!(summary.files.len(), 3);

    let finals = dedupe::list_chunks(&orch.layout().final_chunks)?;
    let contents: Vec<String> = finals.iter().map(fs::read_to_string).collect::<std::io::Result<_>>()?;
    assert_eq!(contents, vec!["a,\nb,\n", "c,\nd,\n", "e\n"]);
    Ok(())
}

#[tokio::test]
async fn test_dropped_or_failing_sources_leave_no_values_behind() -> Result<()> {
    let dir = tempdir()?;
    let a = local_source(dir.path(), "a", "a.txt", "alice\n", "")?;
    let b = local_source(dir.path(), "b", "b.txt", "mallory\n", "")?;
    let mut first = Orchestrator::new(config(dir.path(), &[a.clone(), b])?, false)?;
    first.run_automated(Some(Partition::Nicknames)).await?;
    let nicknames = first.layout().partition_dir("nicknames").join("nicknames.txt");
    assert_eq!(fs::read_to_string(&nicknames)?, "alice\nmallory\n");

    // Source b removed from the configuration
    let mut second = Orchestrator::new(config(dir.path(), &[a.clone()])?, true)?;
    second.run_automated(Some(Partition::Nicknames)).await?;
    assert_eq!(fs::read_to_string(&nicknames)?, "alice\n");
    assert_eq!(fs::read_dir(&second.layout().normalized_text)?.count(), 1);

    // Source b back, but it no longer yields any value
    let b = local_source(dir.path(), "b", "b.txt", "\n", "")?;
    let mut third = Orchestrator::new(config(dir.path(), &[a, b])?, true)?;
    third.run_automated(Some(Partition::Nicknames)).await?;
    assert_eq!(fs::read_to_string(&nicknames)?, "alice\n");
    Ok(())
}

#[tokio::test]
async fn test_forced_full_dedupe_supersedes_chunk_output() -> Result<()> {
    let dir = tempdir()?;
    let old = local_source(dir.path(), "a", "a.txt", "oldvalue\n", "")?;
    let mut first = Orchestrator::new(config(dir.path(), &[old])?, false)?;
    first.run_automated(None).await?;
    assert!(first.layout().deduped_chunks().exists());

    let new = local_source(dir.path(), "a", "a.txt", "newvalue\n", "")?;
    let mut second = Orchestrator::new(config(dir.path(), &[new.clone()])?, true)?;
    second.normalize().await?;
    let report = second.deduplicate(DedupeMode::Full).await?;
    assert_eq!(second.deduped_path()?, report.path);
    assert!(!second.layout().deduped_chunks().exists());

    let summary = second.export(ExportFormat::Streaming, None).await?;
    assert_eq!(fs::read_to_string(&summary.files[0])?, "newvalue,\n");

    // A later session reads the same table
    let third = Orchestrator::new(config(dir.path(), &[new])?, false)?;
    assert_eq!(third.deduped_path()?, report.path);
    Ok(())
}
