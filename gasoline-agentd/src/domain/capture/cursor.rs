use serde::Serialize;
use thiserror::Error;

/// Where a page starts relative to a ring position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Strictly newer than the position.
    After(u64),
    /// Strictly older than the position.
    Before(u64),
    /// The position itself and everything newer.
    Since(u64),
}

impl Cursor {
    pub fn parse(kind: &str, raw: &str) -> Result<Self, CursorError> {
        let position = raw
            .trim()
            .parse::<u64>()
            .map_err(|_| CursorError::Malformed(raw.to_string()))?;
        match kind {
            "after" => Ok(Cursor::After(position)),
            "before" => Ok(Cursor::Before(position)),
            "since" => Ok(Cursor::Since(position)),
            other => Err(CursorError::Malformed(format!("{other}:{raw}"))),
        }
    }

    fn admits(self, position: u64) -> bool {
        match self {
            Cursor::After(cursor) => position > cursor,
            Cursor::Before(cursor) => position < cursor,
            Cursor::Since(cursor) => position >= cursor,
        }
    }

    /// First position the caller has not seen yet, for cursors that read forward.
    fn first_wanted(self) -> Option<u64> {
        match self {
            Cursor::After(cursor) => Some(cursor.saturating_add(1)),
            Cursor::Since(cursor) => Some(cursor),
            Cursor::Before(_) => None,
        }
    }

    fn render(self) -> String {
        match self {
            Cursor::After(p) | Cursor::Before(p) | Cursor::Since(p) => p.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("invalid cursor format: {0:?}")]
    Malformed(String),
    #[error(
        "cursor expired (buffer overflow). Requested position {requested}, oldest available \
         is {oldest}. Lost {} entries",
        .oldest - .requested
    )]
    Expired { requested: u64, oldest: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<Cursor>,
    pub limit: usize,
    pub restart_on_eviction: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    /// Pass back as `after_cursor` to read newer entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_cursor: Option<String>,
    /// Pass back as `before_cursor` to read older entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_cursor: Option<String>,
    pub has_more: bool,
    pub matched: usize,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cursor_restarted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_cursor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Oldest first.
    pub entries: Vec<(u64, T)>,
    pub meta: PageMeta,
    /// True when the page continues forward from the cursor.
    pub forward: bool,
}

/// Cuts one page out of `entries` (positioned, oldest first, already
/// filtered). `oldest` is the ring's oldest retained position, which decides
/// whether a forward cursor still points at live data.
pub fn paginate<T>(
    entries: Vec<(u64, T)>,
    oldest: u64,
    request: PageRequest,
) -> Result<Page<T>, CursorError> {
    let mut meta = PageMeta::default();
    let mut cursor = request.cursor;
    if let Some(wanted) = cursor.and_then(Cursor::first_wanted) {
        if wanted < oldest {
            if !request.restart_on_eviction {
                return Err(CursorError::Expired {
                    requested: wanted,
                    oldest,
                });
            }
            meta.cursor_restarted = true;
            meta.original_cursor = cursor.map(Cursor::render);
            meta.warning = Some(format!(
                "Cursor expired (buffer overflow). Restarted from oldest available entry. \
                 Lost entries: {wanted} to {}",
                oldest - 1
            ));
            cursor = None;
        }
    }

    let mut matched: Vec<(u64, T)> = match cursor {
        Some(cursor) => entries
            .into_iter()
            .filter(|(position, _)| cursor.admits(*position))
            .collect(),
        None => entries,
    };
    meta.matched = matched.len();
    let forward =
        meta.cursor_restarted || matches!(cursor, Some(Cursor::After(_) | Cursor::Since(_)));
    let limit = request.limit.max(1);
    if matched.len() > limit {
        meta.has_more = true;
        if forward {
            matched.truncate(limit);
        } else {
            matched.drain(..matched.len() - limit);
        }
    }
    if let (Some((first, _)), Some((last, _))) = (matched.first(), matched.last()) {
        meta.before_cursor = Some(first.to_string());
        meta.after_cursor = Some(last.to_string());
    }
    Ok(Page {
        entries: matched,
        meta,
        forward,
    })
}
