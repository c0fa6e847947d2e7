use serde::Serialize;

/// Site hierarchy built from `/`-separated site paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteTree {
    pub name: String,
    /// Full path from the root, e.g. `X/north/a`.
    pub path: String,
    pub children: Vec<SiteTree>,
}

impl SiteTree {
    /// Build the tree for `root` from site paths. Paths are expected to start
    /// with `root/`; ones that don't are hung under the root as-is.
    pub fn from_paths<S: AsRef<str>>(root: &str, paths: &[S]) -> Self {
        let mut tree = Self::node(root, root.to_string());
        for path in paths {
            let path = path.as_ref();
            let rest = path
                .strip_prefix(root)
                .and_then(|r| r.strip_prefix('/'))
                .unwrap_or(path);
            tree.insert(rest.split('/').filter(|s| !s.is_empty()));
        }
        tree.sort();
        tree
    }

    fn node(name: &str, path: String) -> Self {
        Self {
            name: name.to_string(),
            path,
            children: Vec::new(),
        }
    }

    fn insert<'a>(&mut self, mut segments: impl Iterator<Item = &'a str>) {
        let Some(head) = segments.next() else {
            return;
        };
        let idx = match self.children.iter().position(|c| c.name == head) {
            Some(i) => i,
            None => {
                let path = format!("{}/{head}", self.path);
                self.children.push(Self::node(head, path));
                self.children.len() - 1
            }
        };
        self.children[idx].insert(segments);
    }

    fn sort(&mut self) {
        self.children.sort_by(|a, b| a.name.cmp(&b.name));
        for c in &mut self.children {
            c.sort();
        }
    }

    /// Every node path, depth first, root included.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        out.push(self.path.clone());
        for c in &self.children {
            c.collect_paths(out);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    pub fn find(&self, path: &str) -> Option<&SiteTree> {
        if self.path == path {
            return Some(self);
        }
        let rest = path.strip_prefix(self.path.as_str())?.strip_prefix('/')?;
        let head = rest.split('/').next()?;
        self.children.iter().find(|c| c.name == head)?.find(path)
    }

    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(SiteTree::depth).max().unwrap_or(0)
    }
}
