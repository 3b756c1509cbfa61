//! Property-based tests for masking, frame headers, status-code
//! classification, and reader robustness against arbitrary input.

mod harness;

use std::time::Duration;

use proptest::prelude::*;

use wsmux::protocol::{
    apply_mask, apply_mask_offset, encode_header, floor_char_boundary, FrameHeader, OpCode,
};
use wsmux::{Config, Status, Upgrader};

fn data_opcode_strategy() -> impl Strategy<Value = OpCode> {
    prop_oneof![
        Just(OpCode::Text),
        Just(OpCode::Binary),
        Just(OpCode::Continuation),
    ]
}

proptest! {
    // =========================================================================
    // Property 1: Masking is an involution
    // =========================================================================
    #[test]
    fn test_mask_involution(
        data in prop::collection::vec(any::<u8>(), 0..2000),
        mask in any::<[u8; 4]>()
    ) {
        let mut masked = data.clone();
        apply_mask(&mut masked, mask);
        apply_mask(&mut masked, mask);
        prop_assert_eq!(data, masked);
    }

    // =========================================================================
    // Property 2: Chunked unmasking with a running offset equals whole-buffer
    // unmasking
    // =========================================================================
    #[test]
    fn test_mask_offset_composition(
        data in prop::collection::vec(any::<u8>(), 1..2000),
        mask in any::<[u8; 4]>(),
        chunk_size in 1usize..257
    ) {
        let mut whole = data.clone();
        apply_mask(&mut whole, mask);

        let mut chunked = data;
        let mut pos = 0u64;
        for chunk in chunked.chunks_mut(chunk_size) {
            let len = chunk.len() as u64;
            apply_mask_offset(chunk, mask, pos);
            pos += len;
        }
        prop_assert_eq!(chunked, whole);
    }

    // =========================================================================
    // Property 3: Header encode → decode round-trip for data frames
    // =========================================================================
    #[test]
    fn test_header_roundtrip(
        fin in any::<bool>(),
        opcode in data_opcode_strategy(),
        len in 0usize..200_000,
        mask in any::<[u8; 4]>()
    ) {
        let mut header = [0u8; 10];
        let n = encode_header(&mut header, opcode, len, fin);

        // re-borrow as a client frame: set the mask bit, append the key
        let mut wire = header[..n].to_vec();
        wire[1] |= 0x80;
        wire.extend_from_slice(&mask);

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let decoded = rt.block_on(async {
            let mut cursor = wire.as_slice();
            FrameHeader::read_from(&mut cursor).await
        }).unwrap();

        prop_assert_eq!(decoded.fin, fin);
        prop_assert_eq!(decoded.opcode, opcode);
        prop_assert_eq!(decoded.length, len as u64);
        prop_assert_eq!(decoded.mask, mask);
    }

    // =========================================================================
    // Property 4: floor_char_boundary always lands on a UTF-8 boundary of
    // any prefix of a valid string
    // =========================================================================
    #[test]
    fn test_floor_char_boundary_valid(s in "\\PC{0,50}", cut in 0usize..200) {
        let bytes = s.as_bytes();
        let cut = cut.min(bytes.len());
        let end = floor_char_boundary(&bytes[..cut]);
        prop_assert!(end <= cut);
        prop_assert!(std::str::from_utf8(&bytes[..end]).is_ok());
        // never trims more than one (partial) character
        prop_assert!(cut - end < 4);
    }

    // =========================================================================
    // Property 5: status-code classification matches the RFC ranges
    // =========================================================================
    #[test]
    fn test_status_classification(code in 0u16..6000) {
        let status = Status::from_u16(code);
        prop_assert_eq!(status.as_u16(), code);

        let sendable = matches!(code, 1000..=1003 | 1007..=1009 | 1011 | 3000..=4999);
        let from_peer = sendable || code == 1010;
        prop_assert_eq!(status.is_valid_to_send(), sendable);
        prop_assert_eq!(status.is_valid_from_peer(), from_peer);
    }
}

// =============================================================================
// Fuzz property: arbitrary bytes fed to a connection always reach a
// terminal state without hanging or panicking
// =============================================================================
proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]
    #[test]
    fn test_reader_terminates_on_arbitrary_input(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async move {
            let (client_io, server_io) = tokio::io::duplex(16 * 1024);
            let upgrader = Upgrader::new(Config::new());
            let accept = tokio::spawn(async move { upgrader.accept(server_io).await });
            let client = harness::TestClient::handshake(client_io, "localhost", &[])
                .await
                .unwrap();
            let conn = accept.await.unwrap().unwrap();

            // echo whatever parses, like a small application would
            let echo = conn.clone();
            tokio::spawn(async move {
                loop {
                    match echo.receive_message().await {
                        Ok((_, mut reader)) => {
                            let mut chunk = [0u8; 1024];
                            loop {
                                match reader.read(&mut chunk).await {
                                    Ok(0) | Err(_) => break,
                                    Ok(_) => {}
                                }
                            }
                        }
                        Err(_) => break,
                    }
                }
            });

            let mut raw = client.into_inner();
            let outcome = tokio::time::timeout(Duration::from_secs(5), async {
                let _ = tokio::io::AsyncWriteExt::write_all(&mut raw, &data).await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut raw).await;
                conn.wait().await
            })
            .await;
            prop_assert!(outcome.is_ok(), "connection never reached a terminal state");
            Ok(())
        })?;
    }
}
