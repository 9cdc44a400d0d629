#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Margins {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Margins {
    pub const ZERO: Margins = Margins {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub(crate) fn with_bottom_offset(self, offset: i32) -> Self {
        Self {
            bottom: self.bottom.saturating_add(offset),
            ..self
        }
    }
}

/// Screen-space rectangle with a bottom-left origin, as host UI layers
/// report world corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRect {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl ViewportRect {
    fn margins_within(&self, screen_width: i32, screen_height: i32) -> Margins {
        Margins {
            left: self.min_x as i32,
            top: (screen_height as f32 - self.max_y) as i32,
            right: (screen_width as f32 - self.max_x) as i32,
            bottom: self.min_y as i32,
        }
    }
}

/// Turns per-frame viewport rectangles into margin updates, emitting only
/// when the margins or the screen size change.
#[derive(Debug, Default)]
pub struct MarginTracker {
    last: Option<(i32, i32, Margins)>,
}

impl MarginTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(
        &mut self,
        screen_width: i32,
        screen_height: i32,
        rect: ViewportRect,
    ) -> Option<Margins> {
        let margins = rect.margins_within(screen_width, screen_height);
        let current = (screen_width, screen_height, margins);
        if self.last == Some(current) {
            return None;
        }
        self.last = Some(current);
        Some(margins)
    }
}
