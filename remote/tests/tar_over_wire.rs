use std::sync::Arc;

use remote::cancel::CancelScope;
use remote::tarstream::{EntryHandler, EntryHeader, EntryMeta, TarSource, tar_copy_dest};
use remote::wire::WireSession;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_test::traced_test;

#[derive(Default)]
struct Collect {
    entries: Vec<(String, Vec<u8>)>,
    fail_on: Option<String>,
}

#[async_trait::async_trait]
impl EntryHandler for Collect {
    async fn handle_entry(
        &mut self,
        header: &EntryHeader,
        content: &mut (dyn AsyncRead + Send + Unpin),
    ) -> anyhow::Result<()> {
        if self.fail_on.as_deref() == Some(header.name.as_str()) {
            anyhow::bail!("refusing {}", header.name);
        }
        let mut data = Vec::new();
        content.read_to_end(&mut data).await?;
        self.entries.push((header.name.clone(), data));
        Ok(())
    }
}

fn sessions() -> (WireSession, WireSession) {
    let (left, right) = tokio::io::duplex(8192);
    let (left_read, left_write) = tokio::io::split(left);
    let (right_read, right_write) = tokio::io::split(right);
    (
        WireSession::spawn(left_read, left_write),
        WireSession::spawn(right_read, right_write),
    )
}

fn file(size: u64) -> EntryMeta {
    EntryMeta {
        size,
        mode: 0o644,
        ..Default::default()
    }
}

fn dir() -> EntryMeta {
    EntryMeta {
        is_dir: true,
        ..Default::default()
    }
}

#[tokio::test]
#[traced_test]
async fn archive_crosses_the_wire() -> anyhow::Result<()> {
    let (source, destination) = sessions();
    let (reader, meta) = destination.broker.create_reader(4096);
    let writer = source.broker.create_writer(&meta)?;
    let big: Arc<[u8]> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let producer = {
        let big = big.clone();
        tokio::spawn(async move {
            let mut tar = TarSource::new(writer, "photos", CancelScope::new());
            tar.write_header(&dir(), "photos").await?;
            tar.write_header(&dir(), "photos/2024").await?;
            tar.write_header(&file(big.len() as u64), "photos/2024/raw.bin")
                .await?;
            tar.write_content(&big).await?;
            tar.write_header(&file(4), "photos/a.jpg").await?;
            tar.write_content(b"jpeg").await?;
            tar.close().await
        })
    };
    let mut collect = Collect::default();
    tar_copy_dest(reader, CancelScope::new(), &mut collect).await?;
    producer.await??;
    let names: Vec<&str> = collect
        .entries
        .iter()
        .map(|(name, _)| name.as_str())
        .collect();
    assert_eq!(names, vec![".", "2024", "2024/raw.bin", "a.jpg"]);
    assert_eq!(collect.entries[2].1, &big[..]);
    assert_eq!(collect.entries[3].1, b"jpeg");
    tokio::try_join!(source.shutdown(), destination.shutdown())?;
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn destination_failure_stops_the_source() -> anyhow::Result<()> {
    let (source, destination) = sessions();
    let (reader, meta) = destination.broker.create_reader(1024);
    let writer = source.broker.create_writer(&meta)?;
    let producer = tokio::spawn(async move {
        let mut tar = TarSource::new(writer, "", CancelScope::new());
        tar.write_header(&file(3), "ok.txt").await?;
        tar.write_content(b"abc").await?;
        tar.write_header(&file(400_000), "huge.bin").await?;
        tar.write_content(&vec![7u8; 400_000]).await?;
        tar.close().await
    });
    let mut collect = Collect {
        fail_on: Some("huge.bin".to_string()),
        ..Default::default()
    };
    let scope = CancelScope::new();
    let error = tar_copy_dest(reader, scope.clone(), &mut collect)
        .await
        .unwrap_err();
    assert!(format!("{error:#}").contains("refusing huge.bin"));
    assert!(scope.is_cancelled());
    assert!(producer.await?.is_err());
    assert_eq!(collect.entries, vec![("ok.txt".to_string(), b"abc".to_vec())]);
    Ok(())
}
