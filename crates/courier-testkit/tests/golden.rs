//! Every golden stream decodes to its listed records through the sync
//! record reader.

use courier_sync::{SyncError, SyncRecordReader};
use courier_testkit::vectors::all_vectors;

#[tokio::test]
async fn test_golden_streams_decode() {
    for vector in all_vectors() {
        let bytes = vector.bytes();
        let mut reader = SyncRecordReader::new(&bytes[..]);
        let mut decoded = Vec::new();
        let outcome = loop {
            match reader.read_next().await {
                Ok(Some(message)) => decoded.push(message),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        assert_eq!(decoded, vector.expected(), "vector '{}'", vector.name);
        match outcome {
            Ok(()) => assert!(!vector.error, "vector '{}' should fail", vector.name),
            Err(SyncError::Format(e)) => {
                assert!(vector.error, "vector '{}' failed: {e}", vector.name)
            }
            Err(e) => panic!("vector '{}': unexpected error {e}", vector.name),
        }
    }
}

#[tokio::test]
async fn test_end_of_stream_is_sticky() {
    let vector = all_vectors()
        .into_iter()
        .find(|v| v.name == "versions announcing protocol 0")
        .unwrap();
    let bytes = vector.bytes();
    let mut reader = SyncRecordReader::new(&bytes[..]);
    assert!(reader.has_versions().await.unwrap());
    reader.read_versions().await.unwrap();
    assert!(reader.eof().await.unwrap());
    assert!(reader.eof().await.unwrap());
    assert!(reader.read_next().await.unwrap().is_none());
}
