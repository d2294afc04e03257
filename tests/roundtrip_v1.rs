use std::io::Cursor;

use luksforge::{encrypt_v1_with, read_headers, CreateParams, LuksError, VolumeHeader};

fn fast_params() -> CreateParams {
    CreateParams {
        pbkdf2_iterations: Some(1_000),
        ..Default::default()
    }
}

fn make_volume(passwords: &[&str], payload: &[u8]) -> Vec<u8> {
    let (header, mut encrypt) = encrypt_v1_with(passwords, &fast_params()).unwrap();
    let mut image = header;
    image.extend(encrypt.encrypt(payload).unwrap());
    image
}

#[test]
fn test_roundtrip_single_password() {
    let payload = vec![0u8; 4096];
    let image = make_volume(&["hunter2"], &payload);
    let mut device = Cursor::new(image);

    let VolumeHeader::V1(header) = read_headers(&mut device).unwrap() else {
        panic!("expected a v1 header");
    };
    let mut unsealed = header.check(b"hunter2", &mut device).unwrap();
    assert_eq!(
        unsealed.payload_offset,
        header.payload_offset as u64 * 512
    );
    assert_eq!(unsealed.payload_size, 4096);

    let ciphertext = &device.get_ref()[unsealed.payload_offset as usize..];
    let plaintext = unsealed.stream.decrypt(ciphertext).unwrap();
    assert_eq!(plaintext, payload);

    assert!(matches!(
        header.check(b"hunter3", &mut device),
        Err(LuksError::WrongPassword)
    ));
}

#[test]
fn test_multiple_passwords() {
    let payload: Vec<u8> = (0..8192).map(|i| (i % 256) as u8).collect();
    let image = make_volume(&["a", "b", "c"], &payload);
    let mut device = Cursor::new(image);

    let VolumeHeader::V1(header) = read_headers(&mut device).unwrap() else {
        panic!("expected a v1 header");
    };
    assert!(header.check_slot_active(0));
    assert!(header.check_slot_active(1));
    assert!(header.check_slot_active(2));
    assert!(!header.check_slot_active(3));
    assert!(!header.check_slot_active(7));

    for password in ["a", "b", "c"] {
        let mut unsealed = header.check(password.as_bytes(), &mut device).unwrap();
        let ciphertext = &device.get_ref()[unsealed.payload_offset as usize..];
        assert_eq!(unsealed.stream.decrypt(ciphertext).unwrap(), payload);
    }
    assert!(matches!(
        header.check(b"d", &mut device),
        Err(LuksError::WrongPassword)
    ));
}

#[test]
fn test_all_slots_disabled() {
    let mut image = make_volume(&["hunter2"], &[0u8; 512]);
    // flip the only active slot tag (first slot, at offset 208) to disabled
    image[208..212].copy_from_slice(&0x0000_DEADu32.to_be_bytes());
    let mut device = Cursor::new(image);

    let VolumeHeader::V1(header) = read_headers(&mut device).unwrap() else {
        panic!("expected a v1 header");
    };
    assert!(matches!(
        header.check(b"hunter2", &mut device),
        Err(LuksError::NoPasswords)
    ));
}

#[test]
fn test_truncated_key_material() {
    let (header_bytes, _) = encrypt_v1_with(&["hunter2"], &fast_params()).unwrap();
    // cut the device off in the middle of the first key material area
    let mut device = Cursor::new(header_bytes[..8192].to_vec());

    let VolumeHeader::V1(header) = read_headers(&mut device).unwrap() else {
        panic!("expected a v1 header");
    };
    assert!(matches!(
        header.check(b"hunter2", &mut device),
        Err(LuksError::SlotTruncated { slot: 0 })
    ));
}

#[test]
fn test_payload_longer_than_one_call() {
    let payload: Vec<u8> = (0..512 * 8).map(|i| (i * 31 % 256) as u8).collect();
    let (header_bytes, mut encrypt) = encrypt_v1_with(&["split"], &fast_params()).unwrap();

    // encrypt the payload across several stream calls
    let mut image = header_bytes;
    for chunk in payload.chunks(512 * 3) {
        image.extend(encrypt.encrypt(chunk).unwrap());
    }
    let mut device = Cursor::new(image);

    let VolumeHeader::V1(header) = read_headers(&mut device).unwrap() else {
        panic!("expected a v1 header");
    };
    let mut unsealed = header.check(b"split", &mut device).unwrap();
    let ciphertext = &device.get_ref()[unsealed.payload_offset as usize..];
    let mut plaintext = Vec::new();
    for chunk in ciphertext.chunks(512 * 2) {
        plaintext.extend(unsealed.stream.decrypt(chunk).unwrap());
    }
    assert_eq!(plaintext, payload);
}
