//! Typo-tolerant predicate lookup.
//!
//! The edit distance weights substitutions by physical key distance on a US
//! QWERTY layout, so `-xtpye` lands closer to `-xtype` than to anything
//! else in the dispatch table.

/// Cost of inserting or deleting one character.
const IN_DEL_COST: i32 = 12;

/// Approximate (x, y) position of a character on a US QWERTY keyboard.
/// Horizontal positions are doubled so the half-key stagger between rows
/// stays integral; shifted characters map to their base key.
fn key_coords(c: u8) -> (i32, i32) {
    fn row(keys: &[u8], y: i32, x0: i32) -> impl Fn(u8) -> Option<(i32, i32)> + '_ {
        move |c: u8| {
            keys.iter()
                .position(|&k| k == c)
                .map(|i| (x0 + 2 * i as i32, y))
        }
    }
    let digits = row(b"`1234567890-=", 0, 0);
    let top = row(b"qwertyuiop[]\\", 1, 3);
    let home = row(b"asdfghjkl;'", 2, 4);
    let bottom = row(b"zxcvbnm,./", 3, 5);
    let shifted: &[(u8, u8)] = &[
        (b'~', b'`'),
        (b'!', b'1'),
        (b'@', b'2'),
        (b'#', b'3'),
        (b'$', b'4'),
        (b'%', b'5'),
        (b'^', b'6'),
        (b'&', b'7'),
        (b'*', b'8'),
        (b'(', b'9'),
        (b')', b'0'),
        (b'_', b'-'),
        (b'+', b'='),
        (b'{', b'['),
        (b'}', b']'),
        (b'|', b'\\'),
        (b':', b';'),
        (b'"', b'\''),
        (b'<', b','),
        (b'>', b'.'),
        (b'?', b'/'),
    ];

    let c = c.to_ascii_lowercase();
    let c = shifted
        .iter()
        .find(|(from, _)| *from == c)
        .map_or(c, |(_, to)| *to);
    if c == b' ' {
        return (12, 4);
    }
    digits(c)
        .or_else(|| top(c))
        .or_else(|| home(c))
        .or_else(|| bottom(c))
        .unwrap_or((20, 2))
}

fn key_distance(a: u8, b: u8) -> i32 {
    let (ax, ay) = key_coords(a);
    let (bx, by) = key_coords(b);
    (ax - bx).abs() + (ay - by).abs()
}

/// Weighted edit distance between a typed token and a candidate.
pub fn typo_distance(actual: &str, expected: &str) -> i32 {
    let actual = actual.as_bytes();
    let expected = expected.as_bytes();
    let cols = expected.len() + 1;
    let mut prev: Vec<i32> = (0..cols as i32).map(|j| j * IN_DEL_COST).collect();
    let mut cur = vec![0; cols];
    for (i, &a) in actual.iter().enumerate() {
        cur[0] = (i as i32 + 1) * IN_DEL_COST;
        for (j, &e) in expected.iter().enumerate() {
            let substitute = prev[j] + if a == e { 0 } else { key_distance(a, e) };
            let delete = prev[j + 1] + IN_DEL_COST;
            let insert = cur[j] + IN_DEL_COST;
            cur[j + 1] = substitute.min(delete).min(insert);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[expected.len()]
}

/// The candidate from `names` closest to `token`.
pub fn best_match<'a>(token: &str, names: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    names.min_by_key(|name| typo_distance(token, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_cost_nothing() {
        assert_eq!(typo_distance("-xtype", "-xtype"), 0);
    }

    #[test]
    fn neighboring_keys_beat_distant_ones() {
        // s and a are adjacent; s and p are across the board.
        assert!(typo_distance("-size", "-aize") < typo_distance("-size", "-pize"));
    }

    #[test]
    fn insertions_cost_a_fixed_amount() {
        assert_eq!(typo_distance("-size", "-sizes"), IN_DEL_COST);
        assert_eq!(typo_distance("-sizes", "-size"), IN_DEL_COST);
    }

    #[test]
    fn transposed_type_suggests_xtype() {
        let names = ["-type", "-xtype", "-size", "-true", "-print", "-mtime"];
        assert_eq!(
            best_match("-xtpye", names.iter().copied()),
            Some("-xtype")
        );
    }
}
