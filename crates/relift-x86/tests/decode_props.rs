#![cfg(not(target_arch = "wasm32"))]

use proptest::prelude::*;
use relift_x86::opcode_tables::{self, OpcodeKey, OpcodeSpec};
use relift_x86::{decode, MAX_INST_LEN};

fn encode_entry(key: OpcodeKey, spec: OpcodeSpec, modrm_low: u8, tail: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    if key.opcode >= 0x0f00 {
        bytes.push(0x0f);
    }
    bytes.push(key.opcode as u8);
    if let Some(modrm) = spec.shape.exact_modrm() {
        bytes.push(modrm);
    } else if spec.shape.has_modrm() {
        let reg = key.reg.unwrap_or((modrm_low >> 3) & 7);
        bytes.push((modrm_low & 0b1100_0111) | (reg << 3));
    }
    bytes.extend_from_slice(tail);
    bytes
}

#[test]
fn every_table_entry_decodes_to_its_mnemonic() {
    for (key, spec) in opcode_tables::entries() {
        let bytes = encode_entry(key, spec, 0xc0, &[0; 12]);
        let (inst, len) = decode(&bytes, 0x1000)
            .unwrap_or_else(|e| panic!("{key:?} failed to decode: {e}"));
        assert_eq!(inst.mnemonic, spec.mnemonic, "{key:?}");
        assert_eq!(inst.opcode, key.opcode);
        assert_eq!(inst.len() as usize, len);
        if spec.rmw {
            assert_eq!(inst.operands[0], inst.operands[1], "{key:?}");
        }
    }
}

#[test]
fn group_opcodes_have_no_plain_entry() {
    for (key, _) in opcode_tables::entries() {
        if key.reg.is_some() {
            assert!(opcode_tables::is_group(key.opcode));
            assert_eq!(opcode_tables::lookup(key.opcode, None), None);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 2048,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decode_is_deterministic(
        address in any::<u32>(),
        bytes in proptest::collection::vec(any::<u8>(), 1..=16),
    ) {
        prop_assert_eq!(decode(&bytes, address), decode(&bytes, address));
    }

    #[test]
    fn next_address_matches_consumed(
        address in 0u32..0xffff_0000,
        bytes in proptest::collection::vec(any::<u8>(), 1..=16),
    ) {
        if let Ok((inst, len)) = decode(&bytes, address) {
            prop_assert!(len >= 1 && len <= MAX_INST_LEN, "len={} bytes={:02x?}", len, bytes);
            prop_assert_eq!(inst.next_address - inst.address, len as u32);
            prop_assert_eq!(inst.address, address);
        }
    }

    #[test]
    fn table_entries_decode_for_any_addressing_form(
        entry in 0..opcode_tables::entries().count(),
        modrm_low in any::<u8>(),
        tail in proptest::collection::vec(any::<u8>(), 12),
    ) {
        let (key, spec) = opcode_tables::entries().nth(entry).unwrap();
        let bytes = encode_entry(key, spec, modrm_low, &tail);
        let (inst, len) = decode(&bytes, 0x40_0000).unwrap();
        prop_assert_eq!(inst.mnemonic, spec.mnemonic);
        prop_assert!(len <= MAX_INST_LEN);
        prop_assert_eq!(inst.len() as usize, len);
    }
}
