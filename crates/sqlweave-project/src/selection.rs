//! Model selection for partial runs

/// Which models a run should cover
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    All,

    /// Named models; how their upstream is treated depends on the
    /// `SelectionPolicy`
    Models(Vec<String>),
}

impl Selection {
    pub fn models<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Models(names.into_iter().map(Into::into).collect())
    }

    /// Parse a comma separated list such as `stg_orders,fct_orders`.
    ///
    /// An empty list selects everything.
    pub fn parse(list: &str) -> Self {
        let names: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        if names.is_empty() {
            Self::All
        } else {
            Self::Models(names)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_selection_list() {
        assert_eq!(Selection::parse(""), Selection::All);
        assert_eq!(Selection::parse(" , "), Selection::All);
        assert_eq!(
            Selection::parse("stg_orders, fct_orders"),
            Selection::models(["stg_orders", "fct_orders"])
        );
    }
}
