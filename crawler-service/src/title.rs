//! Title normalization and ICP scoring. Both are pure functions invoked
//! from the autodiscovery stage when people are upserted.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleFamily {
    Executive,
    Engineering,
    Product,
    Sales,
    Marketing,
    Finance,
    Operations,
    People,
    Other,
}

impl RoleFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleFamily::Executive => "executive",
            RoleFamily::Engineering => "engineering",
            RoleFamily::Product => "product",
            RoleFamily::Sales => "sales",
            RoleFamily::Marketing => "marketing",
            RoleFamily::Finance => "finance",
            RoleFamily::Operations => "operations",
            RoleFamily::People => "people",
            RoleFamily::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Seniority {
    Ic,
    Manager,
    Director,
    Vp,
    CLevel,
}

impl Seniority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Seniority::Ic => "ic",
            Seniority::Manager => "manager",
            Seniority::Director => "director",
            Seniority::Vp => "vp",
            Seniority::CLevel => "c_level",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedTitle {
    pub title_norm: String,
    pub role_family: RoleFamily,
    pub seniority: Seniority,
}

pub fn normalize_title(raw: &str) -> NormalizedTitle {
    let title_norm = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let t = title_norm.as_str();

    let seniority = if t.contains("chief")
        || t.starts_with("ceo") || t.contains(" ceo")
        || t.starts_with("cto") || t.contains(" cto")
        || t.starts_with("cfo") || t.contains(" cfo")
        || t.starts_with("coo") || t.contains(" coo")
        || t.contains("founder") || t.contains("president") || t.contains("owner")
    {
        Seniority::CLevel
    } else if t.contains("vp") || t.contains("vice president") {
        Seniority::Vp
    } else if t.contains("director") || t.contains("head of") {
        Seniority::Director
    } else if t.contains("manager") || t.contains("lead") {
        Seniority::Manager
    } else {
        Seniority::Ic
    };

    let role_family = if t.contains("sales")
        || t.contains("revenue") || t.contains("account executive") || t.contains("business development")
    {
        RoleFamily::Sales
    } else if t.contains("market") || t.contains("growth") || t.contains("brand") {
        RoleFamily::Marketing
    } else if t.contains("engineer") || t.contains("cto") || t.contains("technolog")
        || t.contains("developer") || t.contains("architect") || t.contains("software")
    {
        RoleFamily::Engineering
    } else if t.contains("product") || t.contains("design") {
        RoleFamily::Product
    } else if t.contains("finance") || t.contains("cfo") || t.contains("accounting") {
        RoleFamily::Finance
    } else if t.contains("operations") || t.contains("coo") || t.contains("supply") {
        RoleFamily::Operations
    } else if t.contains("people") || t.contains("talent") || t.contains("human resources")
        || t.contains("hr ")
    {
        RoleFamily::People
    } else if matches!(seniority, Seniority::CLevel) {
        RoleFamily::Executive
    } else {
        RoleFamily::Other
    };

    NormalizedTitle { title_norm, role_family, seniority }
}

/// ICP fit on a 0-100 scale from seniority and role family alone; the
/// richer scoring model is an external collaborator, this prior keeps
/// ranking sane when it is absent.
pub fn icp_score(role_family: RoleFamily, seniority: Seniority) -> i32 {
    let seniority_points = match seniority {
        Seniority::CLevel => 50,
        Seniority::Vp => 42,
        Seniority::Director => 34,
        Seniority::Manager => 22,
        Seniority::Ic => 10,
    };
    let family_points = match role_family {
        RoleFamily::Executive => 40,
        RoleFamily::Sales | RoleFamily::Marketing => 35,
        RoleFamily::Engineering | RoleFamily::Product => 30,
        RoleFamily::Operations | RoleFamily::Finance => 25,
        RoleFamily::People => 20,
        RoleFamily::Other => 10,
    };
    seniority_points + family_points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_level_detection() {
        let n = normalize_title("  Chief  Technology   Officer ");
        assert_eq!(n.title_norm, "chief technology officer");
        assert_eq!(n.seniority, Seniority::CLevel);
        assert_eq!(n.role_family, RoleFamily::Engineering);
    }

    #[test]
    fn vp_of_sales() {
        let n = normalize_title("VP of Sales");
        assert_eq!(n.seniority, Seniority::Vp);
        assert_eq!(n.role_family, RoleFamily::Sales);
    }

    #[test]
    fn plain_engineer_is_ic() {
        let n = normalize_title("Software Engineer");
        assert_eq!(n.seniority, Seniority::Ic);
        assert_eq!(n.role_family, RoleFamily::Engineering);
    }

    #[test]
    fn score_is_bounded_and_ordered() {
        let top = icp_score(RoleFamily::Executive, Seniority::CLevel);
        let bottom = icp_score(RoleFamily::Other, Seniority::Ic);
        assert!(top <= 100 && bottom >= 0);
        assert!(top > icp_score(RoleFamily::Sales, Seniority::Vp));
        assert!(icp_score(RoleFamily::Sales, Seniority::Vp) > bottom);
    }
}
