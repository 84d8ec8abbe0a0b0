//! Client-side filtering: parsed once from the interface argument's
//! comma-separated suffixes, applied to every frame the daemon delivers.
//! Unlike `SET_MASK`, this never touches the daemon — matching the original
//! dumper, which reads everything and filters locally rather than asking
//! the driver to.

use canrm_core::CanIdFlags;

#[derive(Debug, Clone, Copy)]
pub struct CanFilter {
    id: u32,
    mask: u32,
    invert: bool,
}

/// Splits `<ifname>[,filter]*` into the interface name and its filters.
pub fn parse_target(arg: &str) -> (String, Vec<CanFilter>) {
    let mut tokens = arg.split(',');
    let ifname = tokens.next().unwrap_or_default().to_string();
    let filters = tokens.filter_map(parse_one).collect();
    (ifname, filters)
}

fn parse_one(token: &str) -> Option<CanFilter> {
    let (sep_index, invert) = token
        .char_indices()
        .find_map(|(i, c)| match c {
            ':' => Some((i, false)),
            '~' => Some((i, true)),
            _ => None,
        })?;

    let id_str = &token[..sep_index];
    let mask_str = &token[sep_index + 1..];

    let mut id = u32::from_str_radix(id_str, 16).ok()?;
    let mask = u32::from_str_radix(mask_str, 16).ok()? & !CanIdFlags::ERR.bits();

    if id_str.len() == 8 {
        id |= CanIdFlags::EFF.bits();
    }

    Some(CanFilter { id, mask, invert })
}

/// An empty filter set passes everything, matching the dumper's own
/// "no given filter" default.
pub fn passes(filters: &[CanFilter], can_id: u32) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| {
        let hit = (can_id & f.mask) == (f.id & f.mask);
        hit != f.invert
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_filter_accepts_and_rejects() {
        let (ifname, filters) = parse_target("can0,123:7FF");
        assert_eq!(ifname, "can0");
        assert!(passes(&filters, 0x123));
        assert!(!passes(&filters, 0x124));
    }

    #[test]
    fn inverse_filter_accepts_the_complement() {
        let (_, filters) = parse_target("can0,123~7FF");
        assert!(!passes(&filters, 0x123));
        assert!(passes(&filters, 0x124));
    }

    #[test]
    fn eight_digit_id_sets_the_eff_flag() {
        let (_, filters) = parse_target("can0,12345678:DFFFFFFF");
        assert!(passes(&filters, 0x12345678 | CanIdFlags::EFF.bits()));
    }

    #[test]
    fn no_filters_passes_everything() {
        let (_, filters) = parse_target("can0");
        assert!(passes(&filters, 0xdead));
    }

    #[test]
    fn multiple_filters_are_comma_separated() {
        let (_, filters) = parse_target("can0,123:7FF,400:700");
        assert_eq!(filters.len(), 2);
    }
}
