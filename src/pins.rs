use rustc_hash::FxHashMap;

/// 40-pin header position to kernel GPIO number. Power and ground
/// positions have no GPIO behind them.
const HEADER_40_PIN: [(u32, Option<u32>); 40] = [
    (1, None),
    (2, None),
    (3, Some(2)),
    (4, None),
    (5, Some(3)),
    (6, None),
    (7, Some(4)),
    (8, Some(14)),
    (9, None),
    (10, Some(15)),
    (11, Some(17)),
    (12, Some(18)),
    (13, Some(27)),
    (14, None),
    (15, Some(22)),
    (16, Some(23)),
    (17, None),
    (18, Some(24)),
    (19, Some(10)),
    (20, None),
    (21, Some(9)),
    (22, Some(25)),
    (23, Some(11)),
    (24, Some(8)),
    (25, None),
    (26, Some(7)),
    (27, Some(0)),
    (28, Some(1)),
    (29, Some(5)),
    (30, None),
    (31, Some(6)),
    (32, Some(12)),
    (33, Some(13)),
    (34, None),
    (35, Some(19)),
    (36, Some(16)),
    (37, Some(26)),
    (38, Some(20)),
    (39, None),
    (40, Some(21)),
];

/// Immutable translation table from logical header positions to hardware
/// pin numbers.
#[derive(Debug, Clone)]
pub struct PinMapping {
    table: FxHashMap<u32, Option<u32>>,
}

impl PinMapping {
    pub fn new(table: FxHashMap<u32, Option<u32>>) -> Self {
        Self { table }
    }

    pub fn header_40_pin() -> Self {
        Self::new(HEADER_40_PIN.into_iter().collect())
    }

    /// Hardware pin for `position`, or `None` when the position is absent or
    /// carries no GPIO.
    pub fn lookup(&self, position: u32) -> Option<u32> {
        self.table.get(&position).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for PinMapping {
    fn default() -> Self {
        Self::header_40_pin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_table_covers_every_position() {
        let mapping = PinMapping::header_40_pin();
        assert_eq!(mapping.len(), 40);
        assert_eq!(mapping.lookup(7), Some(4));
        assert_eq!(mapping.lookup(11), Some(17));
        assert_eq!(mapping.lookup(40), Some(21));
    }

    #[test]
    fn power_and_ground_are_unmapped() {
        let mapping = PinMapping::header_40_pin();
        for position in [1, 2, 4, 6, 9, 14, 17, 20, 25, 30, 34, 39] {
            assert_eq!(mapping.lookup(position), None, "position {position}");
        }
    }

    #[test]
    fn out_of_range_positions_are_unmapped() {
        let mapping = PinMapping::header_40_pin();
        assert_eq!(mapping.lookup(0), None);
        assert_eq!(mapping.lookup(41), None);
    }

    #[test]
    fn custom_table() {
        let mut table = FxHashMap::default();
        table.insert(1, Some(100));
        table.insert(2, None);
        let mapping = PinMapping::new(table);
        assert_eq!(mapping.lookup(1), Some(100));
        assert_eq!(mapping.lookup(2), None);
        assert_eq!(mapping.lookup(3), None);
    }
}
