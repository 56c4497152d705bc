use p2p_direct::adaptive::{
    MAX_BUFFER_HIGH_WATER_MARK, MAX_CHUNK_SIZE, MIN_BUFFER_HIGH_WATER_MARK, MIN_CHUNK_SIZE,
};
use p2p_direct::transfer::{
    MemoryStorage, ReceiverEngine, SendOptions, SenderEngine, SourceFile, memory_channel,
};
use p2p_direct::{ConfigHints, LinkQuality, MemoryClass, TransferConfig, choose_config};

async fn round_trip(config: TransferConfig, data: Vec<u8>) -> Vec<u8> {
    let (tx, mut rx) = memory_channel();
    let mut receiver = ReceiverEngine::new(MemoryStorage::new());
    let handle = tokio::spawn(async move {
        receiver.run(&mut rx).await.unwrap();
        receiver
    });

    let mut sender = SenderEngine::new(config);
    let summary = sender
        .send_batch(
            vec![SourceFile::from_bytes("payload.bin", data)],
            &tx,
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(summary.files.len(), 1);

    let receiver = handle.await.unwrap();
    assert_eq!(receiver.session().unwrap().state(0).unwrap().verified, Some(true));
    receiver.storage().contents(0).unwrap().to_vec()
}

fn data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_smallest_chunks_and_buffer() {
    let config = TransferConfig::default()
        .with_chunk_size(MIN_CHUNK_SIZE)
        .with_high_water_mark(MIN_BUFFER_HIGH_WATER_MARK);
    let input = data(3 * 1024 * 1024 + 17);
    assert_eq!(round_trip(config, input.clone()).await, input);
}

#[tokio::test]
async fn test_largest_chunks_and_buffer() {
    let config = TransferConfig::default()
        .with_chunk_size(MAX_CHUNK_SIZE)
        .with_high_water_mark(MAX_BUFFER_HIGH_WATER_MARK);
    let input = data(5 * 1024 * 1024 + 3);
    assert_eq!(round_trip(config, input.clone()).await, input);
}

#[tokio::test]
async fn test_largest_chunks_with_smallest_buffer() {
    // A single chunk exceeds the mark: the sender must still make progress
    let config = TransferConfig::default()
        .with_chunk_size(MAX_CHUNK_SIZE)
        .with_high_water_mark(MIN_BUFFER_HIGH_WATER_MARK);
    let input = data(4 * 1024 * 1024 + 1);
    assert_eq!(round_trip(config, input.clone()).await, input);
}

#[tokio::test]
async fn test_heuristic_extremes_transfer() {
    let hints = [
        ConfigHints {
            link_quality: Some(LinkQuality::Poor),
            memory: Some(MemoryClass::Low),
            cores: Some(1),
        },
        ConfigHints {
            link_quality: Some(LinkQuality::Excellent),
            memory: Some(MemoryClass::High),
            cores: Some(64),
        },
    ];
    for hint in hints {
        let config = choose_config(&hint);
        assert!((MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&config.chunk_size));
        let input = data(1024 * 1024);
        assert_eq!(round_trip(config, input.clone()).await, input);
    }
}
