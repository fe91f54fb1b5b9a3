//! See [`Category`].

use std::fmt;

/// Number of traffic categories.
pub const CATEGORY_COUNT: usize = 7;

/// Traffic class of an outbound message, governing which token bucket and
/// which outbound queue it charges.
///
/// The order is fixed and meaningful: the sender tick drains category queues
/// in this order, so [`Category::Resend`] traffic always gets first claim on
/// a circuit's bandwidth, and it is also the wire order of the throttle
/// float array exchanged with clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum Category {
    /// Retransmissions of reliable messages which timed out.
    Resend,
    /// Terrain patches.
    Land,
    /// Wind field updates.
    Wind,
    /// Cloud layer updates.
    Cloud,
    /// Object and agent updates.
    Task,
    /// Texture data.
    Texture,
    /// Asset payloads.
    Asset,
}

impl Category {
    /// All categories, in queue-drain and wire order.
    pub const ALL: [Category; CATEGORY_COUNT] = [
        Category::Resend,
        Category::Land,
        Category::Wind,
        Category::Cloud,
        Category::Task,
        Category::Texture,
        Category::Asset,
    ];

    /// Index of this category into per-category arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Gets the category with the given index, if it is in range.
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < CATEGORY_COUNT {
            Some(Self::ALL[index])
        } else {
            None
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Resend => "resend",
            Category::Land => "land",
            Category::Wind => "wind",
            Category::Cloud => "cloud",
            Category::Task => "task",
            Category::Texture => "texture",
            Category::Asset => "asset",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_round_trip() {
        for cat in Category::ALL {
            assert_eq!(Some(cat), Category::from_index(cat.index()));
        }
        assert_eq!(None, Category::from_index(CATEGORY_COUNT));
    }

    #[test]
    fn resend_drains_first() {
        assert_eq!(0, Category::Resend.index());
    }
}
