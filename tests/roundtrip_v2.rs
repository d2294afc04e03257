use std::io::Cursor;

use luksforge::v2::{BinHeader, Magic, Priority, SectorSize, SegmentSize};
use luksforge::{encrypt_v2_with, read_headers, CreateParams, LuksError, VolumeHeader};

fn fast_params() -> CreateParams {
    CreateParams {
        pbkdf2_iterations: Some(1_000),
        argon2_memory_kib: Some(64),
        ..Default::default()
    }
}

#[test]
fn test_layout_of_fresh_volume() {
    let (header, _stream) = encrypt_v2_with(&["p"], &fast_params()).unwrap();
    let mut device = Cursor::new(header.clone());
    let VolumeHeader::V2 { bin, json } = read_headers(&mut device).unwrap() else {
        panic!("expected a v2 header");
    };

    // one password's worth of JSON fits the smallest header bucket
    assert_eq!(bin.hdr_size, 0x8000);
    assert_eq!(json.config.json_size, 0x8000 - 4096);

    // 64 reserved slot areas of 64 * 4000 bytes, each rounded up to 4096
    let stride = 258_048u64;
    assert_eq!(json.config.keyslots_size, stride * 64);
    assert_eq!(json.keyslots[0].area.offset, 2 * 0x8000);

    let segment = &json.segments[0];
    assert_eq!(segment.offset, 2 * 0x8000 + stride * 64);
    assert_eq!(segment.size, SegmentSize::Dynamic);

    // the image ends exactly where the payload starts
    assert_eq!(header.len() as u64, segment.offset);
}

#[test]
fn test_roundtrip_both_sector_sizes() {
    for sector_size in [SectorSize::B512, SectorSize::B4096] {
        let params = CreateParams {
            sector_size: sector_size.clone(),
            ..fast_params()
        };
        let (header, mut encrypt) = encrypt_v2_with(&["correct horse", "battery staple"], &params)
            .unwrap();
        let payload: Vec<u8> = (0..2 * sector_size.as_u64() as usize)
            .map(|i| (i % 256) as u8)
            .collect();
        let mut image = header;
        image.extend(encrypt.encrypt(&payload).unwrap());
        let mut device = Cursor::new(image);

        let VolumeHeader::V2 { bin, json } = read_headers(&mut device).unwrap() else {
            panic!("expected a v2 header");
        };
        for password in ["correct horse", "battery staple"] {
            let mut unsealed = bin.check(password.as_bytes(), &mut device, &json).unwrap();
            assert_eq!(unsealed.stream.sector_size() as u64, sector_size.as_u64());
            assert_eq!(unsealed.payload_size, payload.len() as u64);
            let ciphertext = &device.get_ref()[unsealed.payload_offset as usize..];
            assert_eq!(unsealed.stream.decrypt(ciphertext).unwrap(), payload);
        }
        assert!(matches!(
            bin.check(b"tr0ub4dor", &mut device, &json),
            Err(LuksError::WrongPassword)
        ));
    }
}

#[test]
fn test_ignored_keyslots_leave_no_candidates() {
    let (header, _stream) = encrypt_v2_with(&["p"], &fast_params()).unwrap();
    let mut device = Cursor::new(header);
    let VolumeHeader::V2 { bin, mut json } = read_headers(&mut device).unwrap() else {
        panic!("expected a v2 header");
    };
    json.keyslots[0].priority = Some(Priority::Ignore);
    assert!(matches!(
        bin.check(b"p", &mut device, &json),
        Err(LuksError::NoPasswords)
    ));
}

#[test]
fn test_no_digests_left() {
    let (header, _stream) = encrypt_v2_with(&["p"], &fast_params()).unwrap();
    let mut device = Cursor::new(header);
    let VolumeHeader::V2 { bin, mut json } = read_headers(&mut device).unwrap() else {
        panic!("expected a v2 header");
    };
    json.digests.clear();
    assert!(matches!(
        bin.check(b"p", &mut device, &json),
        Err(LuksError::NoDigests)
    ));
}

#[test]
fn test_secondary_header_recovers_primary_damage() {
    let (mut image, _stream) = encrypt_v2_with(&["p"], &fast_params()).unwrap();
    let hdr_size = 0x8000usize;

    // flip one byte inside the primary's checksum field (offset 448..512)
    image[450] ^= 0xff;
    let VolumeHeader::V2 { bin, json } = read_headers(&mut Cursor::new(image.clone())).unwrap()
    else {
        panic!("expected a v2 header");
    };
    assert_eq!(bin.magic, Magic::Second);
    assert_eq!(bin.hdr_offset, hdr_size as u64);
    assert_eq!(json.keyslots.len(), 1);

    // with the secondary damaged as well nothing is left to trust
    image[hdr_size + 450] ^= 0xff;
    assert!(matches!(
        read_headers(&mut Cursor::new(image)),
        Err(LuksError::HeaderCorrupt(_))
    ));
}

#[test]
fn test_greater_sequence_id_wins() {
    let (image, _stream) = encrypt_v2_with(&["p"], &fast_params()).unwrap();
    let hdr_size = 0x8000usize;
    let json_area = image[4096..hdr_size].to_vec();

    let mut h1 = BinHeader::parse(&image[..4096]).unwrap();
    let mut h2 = BinHeader::parse(&image[hdr_size..hdr_size + 4096]).unwrap();
    h1.seqid = 7;
    h2.seqid = 9;
    h1.checksum = h1.compute_checksum(&json_area).unwrap();
    h2.checksum = h2.compute_checksum(&json_area).unwrap();

    let mut reissued = image.clone();
    reissued[..4096].copy_from_slice(&h1.to_bytes().unwrap());
    reissued[hdr_size..hdr_size + 4096].copy_from_slice(&h2.to_bytes().unwrap());

    let VolumeHeader::V2 { bin, .. } = read_headers(&mut Cursor::new(reissued)).unwrap() else {
        panic!("expected a v2 header");
    };
    assert_eq!(bin.seqid, 9);
    assert_eq!(bin.magic, Magic::Second);
}

#[test]
fn test_unseal_after_reparse_is_stable() {
    // the JSON round-trips through parsing without losing the ability to
    // unseal
    let (header, mut encrypt) = encrypt_v2_with(&["p"], &fast_params()).unwrap();
    let payload = vec![0x5au8; 4096];
    let mut image = header;
    image.extend(encrypt.encrypt(&payload).unwrap());
    let mut device = Cursor::new(image);

    for _ in 0..2 {
        let VolumeHeader::V2 { bin, json } = read_headers(&mut device).unwrap() else {
            panic!("expected a v2 header");
        };
        let mut unsealed = bin.check(b"p", &mut device, &json).unwrap();
        let ciphertext = &device.get_ref()[unsealed.payload_offset as usize..];
        assert_eq!(unsealed.stream.decrypt(ciphertext).unwrap(), payload);
    }
}
