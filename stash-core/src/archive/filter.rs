/*!
Include-folder filtering for archive walks.
*/

/// How the walker treats one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    /// Emit a header (and contents) for the entry
    Archive,
    /// Directory that leads to an included folder: descend without emitting it
    Traverse,
    /// Leave out; directories are not descended
    Skip,
}

/// Allow-list of relative folder prefixes. An empty list includes everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludeFilter {
    terms: Vec<String>,
}

impl IncludeFilter {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|term| term.as_ref().replace('\\', "/"))
            .map(|term| term.trim_start_matches("./").to_string())
            .filter(|term| !term.is_empty())
            .collect();
        Self { terms }
    }

    /// Filter that includes every entry
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Classify a forward-slash relative path; the root is `"."`.
    pub fn classify(&self, relative: &str, is_dir: bool) -> Inclusion {
        if self.terms.is_empty() || relative == "." {
            return Inclusion::Archive;
        }
        if self.terms.iter().any(|term| relative.starts_with(term.as_str())) {
            return Inclusion::Archive;
        }
        if is_dir && self.terms.iter().any(|term| term.starts_with(relative)) {
            return Inclusion::Traverse;
        }
        Inclusion::Skip
    }
}
