//! Marker dictionaries and bit-grid helpers.
//!
//! A code packs an `n x n` grid of cells row-major, most significant bit
//! first, with `1` meaning a white cell.

/// The 4x4 ArUco family (ids 0..50), in canonical orientation. A few ids
/// lie one bit apart under rotation, so bit correction can confuse them.
pub const ARUCO_4X4_CODES: [u64; 50] = [
    0xb532, 0x0f9a, 0x332d, 0x9946, 0x549e, 0x79cc, 0x9e2e, 0xc4f2, 0xfeda, 0xcf56, 0xf991,
    0x11a7, 0x0eb7, 0x2a0f, 0x246a, 0x6563, 0x2153, 0x8958, 0x982a, 0x0599, 0x3c54, 0x7060,
    0x738a, 0x87b7, 0x8a6a, 0xb275, 0xb7cc, 0xc87f, 0xc6ae, 0xcd8e, 0xe8c6, 0xf665, 0xf826,
    0xfff8, 0x0e31, 0x1ca4, 0x2b7a, 0x2592, 0x4789, 0x4e1c, 0x580e, 0x5f78, 0x77c4, 0x86c0,
    0x95ab, 0xa9d9, 0xd2e6, 0xdc80, 0xfc98, 0x0138,
];

/// Value of cell `(row, col)` in an `n x n` code.
pub fn cell(code: u64, n: u32, row: u32, col: u32) -> bool {
    let shift = n * n - 1 - (row * n + col);
    (code >> shift) & 1 == 1
}

/// Pack a row-major cell grid into a code.
pub fn pack(cells: &[bool]) -> u64 {
    cells.iter().fold(0u64, |acc, &white| (acc << 1) | white as u64)
}

/// Rotate an `n x n` code a quarter turn counter-clockwise.
pub fn rotate(code: u64, n: u32) -> u64 {
    let cells: Vec<bool> = (0..n)
        .flat_map(|row| (0..n).map(move |col| cell(code, n, col, n - 1 - row)))
        .collect();
    pack(&cells)
}

/// A successful dictionary lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryMatch {
    /// Index of the code in the dictionary.
    pub id: usize,
    /// Quarter turns applied to the observed code to reach the canonical one.
    pub rotation: u32,
    pub distance: u32,
}

/// Find the closest dictionary code to `observed` over all four rotations.
/// Ties keep the lowest id and the fewest rotations.
pub fn lookup(codes: &[u64], n: u32, observed: u64, max_distance: u32) -> Option<DictionaryMatch> {
    let mut best: Option<DictionaryMatch> = None;
    let mut rotated = observed;
    for rotation in 0..4 {
        for (id, &code) in codes.iter().enumerate() {
            let distance = (rotated ^ code).count_ones();
            if distance <= max_distance && best.is_none_or(|b| distance < b.distance) {
                best = Some(DictionaryMatch {
                    id,
                    rotation,
                    distance,
                });
            }
        }
        rotated = rotate(rotated, n);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_matches_reference_orientations() {
        // Quarter-turn images of id 0 as listed by the reference tables.
        assert_eq!(rotate(0xb532, 4), 0xeb48);
        assert_eq!(rotate(rotate(0xb532, 4), 4), 0x4cad);
        assert_eq!(rotate(rotate(rotate(0xb532, 4), 4), 4), 0x12d7);
    }

    #[test]
    fn test_half_turn_reverses_the_bits() {
        for &code in &ARUCO_4X4_CODES {
            let half = rotate(rotate(code, 4), 4);
            assert_eq!(half, (code as u16).reverse_bits() as u64, "code {code:#06x}");
        }
        assert_eq!(rotate(rotate(ARUCO_4X4_CODES[37], 4), 4), 0x49a4);
    }

    #[test]
    fn test_codes_are_distinct_under_rotation() {
        for (i, &a) in ARUCO_4X4_CODES.iter().enumerate() {
            for &b in &ARUCO_4X4_CODES[i + 1..] {
                let mut rotated = b;
                for _ in 0..4 {
                    assert_ne!(a, rotated);
                    rotated = rotate(rotated, 4);
                }
            }
        }
    }

    #[test]
    fn test_four_rotations_are_identity() {
        for &code in &ARUCO_4X4_CODES {
            let mut rotated = code;
            for _ in 0..4 {
                rotated = rotate(rotated, 4);
            }
            assert_eq!(rotated, code);
        }
    }

    #[test]
    fn test_lookup_recovers_rotated_code() {
        let observed = rotate(ARUCO_4X4_CODES[5], 4);
        let found = lookup(&ARUCO_4X4_CODES, 4, observed, 0).unwrap();
        assert_eq!(found.id, 5);
        assert_eq!(found.rotation, 3);
        assert_eq!(found.distance, 0);
    }

    #[test]
    fn test_lookup_respects_correction_budget() {
        let corrupted = ARUCO_4X4_CODES[0] ^ 0b1;
        assert!(lookup(&ARUCO_4X4_CODES[..1], 4, corrupted, 0).is_none());
        assert_eq!(lookup(&ARUCO_4X4_CODES[..1], 4, corrupted, 1).unwrap().distance, 1);
    }

    #[test]
    fn test_pack_and_cell_agree() {
        let code = ARUCO_4X4_CODES[3];
        let cells: Vec<bool> = (0..4)
            .flat_map(|r| (0..4).map(move |c| cell(code, 4, r, c)))
            .collect();
        assert_eq!(pack(&cells), code);
    }
}
