// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2024 Tesseract Vault Contributors
//! Property-based testing for LUKS1 building blocks
//!
//! Uses proptest to check anti-forensic splitting, sector ciphers and the
//! keyslot layout with arbitrary inputs.

use proptest::prelude::*;
use luks1_vault::config::{LUKS_NUMKEYS, LUKS_STRIPES};
use luks1_vault::crypto::af;
use luks1_vault::volume::header::{HeaderParams, Layout, FIRST_KEYSLOT_SECTOR};
use luks1_vault::{DefaultRegistry, HashAlgorithm, HeaderFormat, Luks1Header, PrimitiveRegistry};

fn hash_strategy() -> impl Strategy<Value = HashAlgorithm> {
    prop_oneof![Just(HashAlgorithm::Sha1), Just(HashAlgorithm::Sha256)]
}

// Key sizes the default registry accepts for XTS and CBC
fn key_strategy() -> impl Strategy<Value = (&'static str, Vec<u8>)> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 32..=32).prop_map(|k| ("xts-plain64", k)),
        prop::collection::vec(any::<u8>(), 64..=64).prop_map(|k| ("xts-plain64", k)),
        prop::collection::vec(any::<u8>(), 16..=16).prop_map(|k| ("cbc-plain", k)),
        prop::collection::vec(any::<u8>(), 32..=32).prop_map(|k| ("cbc-essiv:sha256", k)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: merge inverts split for any key, stripe count and hash
    #[test]
    fn prop_af_split_merge_identity(
        key in prop::collection::vec(any::<u8>(), 1..=128),
        stripes in 1u32..=64,
        hash in hash_strategy(),
    ) {
        let material = af::split(&key, stripes, hash).unwrap();
        prop_assert_eq!(material.len(), key.len() * stripes as usize);
        let merged = af::merge(&material, stripes, hash).unwrap();
        prop_assert_eq!(&merged[..], &key[..]);
    }

    /// Property: changing any byte of the material changes the merged key
    #[test]
    fn prop_af_corruption_detected(
        key in prop::collection::vec(any::<u8>(), 16..=64),
        stripes in 2u32..=32,
        position in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut material = af::split(&key, stripes, HashAlgorithm::Sha256).unwrap();
        let at = position.index(material.len());
        material[at] ^= flip;
        let merged = af::merge(&material, stripes, HashAlgorithm::Sha256).unwrap();
        prop_assert_ne!(&merged[..], &key[..]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: sector decryption inverts encryption at any starting sector
    #[test]
    fn prop_sector_cipher_roundtrip(
        (mode, key) in key_strategy(),
        sectors in prop::collection::vec(any::<u8>(), 512..=512 * 8),
        first_sector in any::<u32>(),
    ) {
        let len = sectors.len() / 512 * 512;
        let plain = &sectors[..len];
        let cipher = DefaultRegistry.sector_cipher("aes", mode, &key).unwrap();

        let mut buf = plain.to_vec();
        cipher.encrypt_sectors(&mut buf, u64::from(first_sector)).unwrap();
        prop_assert_ne!(&buf[..], plain);
        cipher.decrypt_sectors(&mut buf, u64::from(first_sector)).unwrap();
        prop_assert_eq!(&buf[..], plain);
    }

    /// Property: equal plaintext sectors encrypt differently at different indices
    #[test]
    fn prop_sector_iv_depends_on_index(
        (mode, key) in key_strategy(),
        fill in any::<u8>(),
        first_sector in 0u64..1_000_000,
    ) {
        let cipher = DefaultRegistry.sector_cipher("aes", mode, &key).unwrap();
        let mut buf = vec![fill; 1024];
        cipher.encrypt_sectors(&mut buf, first_sector).unwrap();
        prop_assert_ne!(&buf[..512], &buf[512..]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: keyslot areas are aligned, disjoint and precede the payload
    #[test]
    fn prop_layout_invariants(
        key_bytes in 1u32..=128,
        stripes in prop_oneof![Just(LUKS_STRIPES), 1u32..=8000],
        alignment in prop::sample::select(vec![8u64, 64, 1024, 2048, 4096]),
    ) {
        let layout = Layout::compute(key_bytes, stripes, alignment).unwrap();
        let material = (u64::from(key_bytes) * u64::from(stripes)).div_ceil(512);

        let mut previous_end = FIRST_KEYSLOT_SECTOR;
        for offset in layout.keyslot_offsets.iter().map(|&o| u64::from(o)) {
            prop_assert!(offset >= previous_end);
            prop_assert_eq!(offset % FIRST_KEYSLOT_SECTOR, 0);
            previous_end = offset + material;
        }
        prop_assert!(u64::from(layout.payload_offset) >= previous_end);
        prop_assert_eq!(u64::from(layout.payload_offset) % alignment, 0);
    }

    /// Property: a fresh header validates and decodes to itself
    #[test]
    fn prop_new_header_is_consistent(
        key_bytes in prop::sample::select(vec![16u32, 24, 32, 48, 64]),
        hash in hash_strategy(),
        digest in any::<[u8; 20]>(),
        salt in any::<[u8; 32]>(),
        iterations in 1u32..=u32::MAX,
    ) {
        let header = Luks1Header::new(&HeaderParams {
            cipher_name: "aes",
            cipher_mode: "xts-plain64",
            hash_spec: hash.name(),
            key_bytes,
            stripes: LUKS_STRIPES,
            data_alignment: 2048,
            mk_digest: digest,
            mk_digest_salt: salt,
            mk_digest_iter: iterations,
            uuid: "0f0e0d0c-0b0a-4908-8706-050403020100",
        })
        .unwrap();

        let device_size = u64::from(header.payload_offset()) * 512;
        header.validate(device_size).unwrap();
        prop_assert!(header.validate(device_size - 512).is_err());
        prop_assert_eq!(header.first_free_slot(), Some(0));
        prop_assert_eq!(header.keyslots().len(), LUKS_NUMKEYS);

        let decoded = Luks1Header::decode(&header.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded.mk_digest(), &digest);
        prop_assert_eq!(decoded.hash_spec(), hash.name());
        prop_assert_eq!(decoded.payload_offset(), header.payload_offset());
    }
}
