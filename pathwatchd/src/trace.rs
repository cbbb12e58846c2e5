//! Debug-mode per-event trace line (§6):
//! `<wd>\t<watched-path>\t<mask-hex>,<mask-names>\t<cookie>\t<name>\n`
//!
//! The hex value is printed first so a bit the symbolic table doesn't name
//! still shows up.

use inotify::EventMask;

/// Fixed table of the kernel's symbolic event bits, indexed by bit
/// position. Slots with no assigned name (reserved/unused bits) are simply
/// never matched.
const KNOWN_BITS: [(u32, &str); 16] = [
    (0x0000_0001, "IN_ACCESS"),
    (0x0000_0002, "IN_MODIFY"),
    (0x0000_0004, "IN_ATTRIB"),
    (0x0000_0008, "IN_CLOSE_WRITE"),
    (0x0000_0010, "IN_CLOSE_NOWRITE"),
    (0x0000_0020, "IN_OPEN"),
    (0x0000_0040, "IN_MOVED_FROM"),
    (0x0000_0080, "IN_MOVED_TO"),
    (0x0000_0100, "IN_CREATE"),
    (0x0000_0200, "IN_DELETE"),
    (0x0000_0400, "IN_DELETE_SELF"),
    (0x0000_0800, "IN_MOVE_SELF"),
    (0x0000_2000, "IN_UNMOUNT"),
    (0x0000_4000, "IN_Q_OVERFLOW"),
    (0x0000_8000, "IN_IGNORED"),
    (0x4000_0000, "IN_ISDIR"),
];

fn mask_names(bits: u32) -> String {
    let mut names = Vec::new();
    for shift in 0..32u32 {
        let bit = 1u32 << shift;
        if bits & bit == 0 {
            continue;
        }
        if let Some((_, name)) = KNOWN_BITS.iter().find(|(b, _)| *b == bit) {
            names.push(*name);
        }
    }
    names.join(",")
}

/// `wd` is a pre-formatted representation of the watch descriptor (its
/// fields aren't publicly readable outside the `inotify` crate, so callers
/// pass `format!("{:?}", event.wd)`).
pub fn format_event(
    wd: &str,
    watched_path: &[u8],
    mask: EventMask,
    cookie: u32,
    name: Option<&[u8]>,
) -> String {
    format!(
        "{}\t{}\t{:#x},{}\t{}\t{}",
        wd,
        String::from_utf8_lossy(watched_path),
        mask.bits(),
        mask_names(mask.bits()),
        cookie,
        name.map(String::from_utf8_lossy).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hex_before_names() {
        let line = format_event("3", b"/watched", EventMask::CREATE, 0, Some(b"new"));
        assert!(line.starts_with("3\t/watched\t0x100,IN_CREATE\t0\tnew"));
    }

    #[test]
    fn combines_multiple_bit_names() {
        let mask = EventMask::MOVED_TO | EventMask::ISDIR;
        let line = format_event("1", b"/d", mask, 42, Some(b"x"));
        assert!(line.contains("IN_MOVED_TO,IN_ISDIR"));
    }
}
