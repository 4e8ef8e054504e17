//! Search specifications and their decomposition inputs.

use serde::{Deserialize, Serialize};

use crate::dedup::DuplicatePolicy;
use crate::error::{EngineError, Result};
use crate::leads::LeadFields;

/// Upper bound on grid rows/cols so a typo cannot schedule millions of cells.
pub const MAX_GRID_DIMENSION: u32 = 100;

/// What a job should search for and how results are shaped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSpec {
    /// Free-text query, e.g. `"dentists"`.
    pub query: String,
    /// Location strings; each becomes one task.
    #[serde(default)]
    pub locations: Vec<String>,
    /// Optional geographic sweep; each cell becomes one task.
    #[serde(default)]
    pub grid: Option<GridSpec>,
    #[serde(default)]
    pub fields: FieldSelection,
    #[serde(default)]
    pub filters: PostFilters,
    /// Dispatch stops once this many new leads are committed.
    #[serde(default)]
    pub target_leads: Option<u64>,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

impl SearchSpec {
    /// Single keyword + location search.
    pub fn keyword(query: impl Into<String>, location: impl Into<String>) -> Self {
        Self::for_locations(query, [location.into()])
    }

    /// Bulk sweep over explicit locations.
    pub fn for_locations<I, S>(query: impl Into<String>, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query: query.into(),
            locations: locations.into_iter().map(Into::into).collect(),
            grid: None,
            fields: FieldSelection::default(),
            filters: PostFilters::default(),
            target_leads: None,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    /// One location per city, formatted `"City, State"`.
    pub fn for_state<I, S>(query: impl Into<String>, state: &str, cities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let state = state.trim();
        Self::for_locations(
            query,
            cities
                .into_iter()
                .map(|city| format!("{}, {}", city.as_ref().trim(), state)),
        )
    }

    pub fn for_postal_codes<I, S>(query: impl Into<String>, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::for_locations(
            query,
            codes.into_iter().map(|code| code.as_ref().trim().to_string()),
        )
    }

    /// Geographic sweep without named locations.
    pub fn for_grid(query: impl Into<String>, grid: GridSpec) -> Self {
        Self {
            grid: Some(grid),
            ..Self::for_locations(query, Vec::<String>::new())
        }
    }

    pub fn with_target(mut self, target: u64) -> Self {
        self.target_leads = Some(target);
        self
    }

    pub fn with_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_filters(mut self, filters: PostFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_fields(mut self, fields: FieldSelection) -> Self {
        self.fields = fields;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(EngineError::InvalidSpec("query must not be empty".into()));
        }
        if self.locations.iter().any(|l| l.trim().is_empty()) {
            return Err(EngineError::InvalidSpec("locations must not contain blanks".into()));
        }
        if self.locations.is_empty() && self.grid.is_none() {
            return Err(EngineError::InvalidSpec(
                "at least one location or a grid is required".into(),
            ));
        }
        if let Some(grid) = &self.grid {
            grid.validate()?;
        }
        if self.target_leads == Some(0) {
            return Err(EngineError::InvalidSpec("target_leads must be positive".into()));
        }
        if let Some(rating) = self.filters.min_rating
            && !(0.0..=5.0).contains(&rating)
        {
            return Err(EngineError::InvalidSpec(format!(
                "min_rating {rating} outside 0-5"
            )));
        }
        Ok(())
    }
}

/// Bounding box split into `rows x cols` cells.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
    pub rows: u32,
    pub cols: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    pub fn center(&self) -> (f64, f64) {
        ((self.south + self.north) / 2.0, (self.west + self.east) / 2.0)
    }
}

impl GridSpec {
    pub fn validate(&self) -> Result<()> {
        let coords = [self.south, self.west, self.north, self.east];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(EngineError::InvalidSpec("grid bounds must be finite".into()));
        }
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            return Err(EngineError::InvalidSpec("grid latitude outside -90..90".into()));
        }
        if !(-180.0..=180.0).contains(&self.west) || !(-180.0..=180.0).contains(&self.east) {
            return Err(EngineError::InvalidSpec("grid longitude outside -180..180".into()));
        }
        if self.south >= self.north || self.west >= self.east {
            return Err(EngineError::InvalidSpec("grid bounds are empty or inverted".into()));
        }
        if self.rows == 0
            || self.cols == 0
            || self.rows > MAX_GRID_DIMENSION
            || self.cols > MAX_GRID_DIMENSION
        {
            return Err(EngineError::InvalidSpec(format!(
                "grid must be between 1x1 and {MAX_GRID_DIMENSION}x{MAX_GRID_DIMENSION}"
            )));
        }
        Ok(())
    }

    /// Cells in row-major order, starting from the south-west corner.
    pub fn cells(&self) -> Vec<(u32, u32, BoundingBox)> {
        let lat_step = (self.north - self.south) / f64::from(self.rows);
        let lng_step = (self.east - self.west) / f64::from(self.cols);
        let mut cells = Vec::with_capacity((self.rows * self.cols) as usize);
        for row in 0..self.rows {
            for col in 0..self.cols {
                let south = self.south + lat_step * f64::from(row);
                let west = self.west + lng_step * f64::from(col);
                cells.push((
                    row,
                    col,
                    BoundingBox {
                        south,
                        west,
                        north: if row + 1 == self.rows { self.north } else { south + lat_step },
                        east: if col + 1 == self.cols { self.east } else { west + lng_step },
                    },
                ));
            }
        }
        cells
    }
}

/// Optional fields to keep on stored leads. Identity fields (name, place id)
/// are always kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelection {
    pub address: bool,
    pub phone: bool,
    pub website: bool,
    pub email: bool,
    pub category: bool,
    pub hours: bool,
    pub socials: bool,
    pub rating: bool,
    pub coordinates: bool,
}

impl Default for FieldSelection {
    fn default() -> Self {
        Self::all()
    }
}

impl FieldSelection {
    pub fn all() -> Self {
        Self {
            address: true,
            phone: true,
            website: true,
            email: true,
            category: true,
            hours: true,
            socials: true,
            rating: true,
            coordinates: true,
        }
    }

    fn flags(&self) -> [bool; 9] {
        [
            self.address,
            self.phone,
            self.website,
            self.email,
            self.category,
            self.hours,
            self.socials,
            self.rating,
            self.coordinates,
        ]
    }

    /// True when every field selected here is also selected in `other`.
    pub fn is_subset_of(&self, other: &FieldSelection) -> bool {
        self.flags()
            .iter()
            .zip(other.flags())
            .all(|(mine, theirs)| !*mine || theirs)
    }

    pub fn apply(&self, fields: &mut LeadFields) {
        if !self.address {
            fields.address = None;
            fields.city = None;
            fields.state = None;
            fields.postal_code = None;
        }
        if !self.phone {
            fields.phone = None;
        }
        if !self.website {
            fields.website = None;
        }
        if !self.email {
            fields.email = None;
        }
        if !self.category {
            fields.category = None;
        }
        if !self.hours {
            fields.hours = None;
        }
        if !self.socials {
            fields.socials.clear();
        }
        if !self.rating {
            fields.rating = None;
            fields.review_count = None;
        }
        if !self.coordinates {
            fields.latitude = None;
            fields.longitude = None;
        }
    }
}

/// Candidates failing any filter are dropped before deduplication.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostFilters {
    pub min_rating: Option<f32>,
    pub min_reviews: Option<u32>,
    pub require_phone: bool,
    pub require_website: bool,
    /// Case-insensitive substrings; a candidate must match one when non-empty.
    pub categories: Vec<String>,
}

impl PostFilters {
    pub fn admits(&self, fields: &LeadFields) -> bool {
        if let Some(min) = self.min_rating
            && fields.rating.is_none_or(|r| r < min)
        {
            return false;
        }
        if let Some(min) = self.min_reviews
            && fields.review_count.is_none_or(|r| r < min)
        {
            return false;
        }
        if self.require_phone && !fields.has_phone() {
            return false;
        }
        if self.require_website && !fields.has_website() {
            return false;
        }
        if !self.categories.is_empty() {
            let Some(category) = fields.category.as_deref().map(str::to_lowercase) else {
                return false;
            };
            if !self
                .categories
                .iter()
                .any(|wanted| category.contains(&wanted.to_lowercase()))
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_preset_formats_city_state() {
        let spec = SearchSpec::for_state("gyms", " Maharashtra ", ["Pune", "Nagpur "]);
        assert_eq!(spec.locations, ["Pune, Maharashtra", "Nagpur, Maharashtra"]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_inputs() {
        assert!(SearchSpec::keyword("  ", "Pune").validate().is_err());
        assert!(SearchSpec::for_locations("cafes", Vec::<String>::new()).validate().is_err());
        assert!(SearchSpec::keyword("cafes", "Pune").with_target(0).validate().is_err());
    }

    #[test]
    fn grid_cells_cover_the_box_row_major() {
        let grid = GridSpec {
            south: 18.0,
            west: 73.0,
            north: 19.0,
            east: 74.5,
            rows: 2,
            cols: 3,
        };
        let cells = grid.cells();
        assert_eq!(cells.len(), 6);
        assert_eq!((cells[0].0, cells[0].1), (0, 0));
        assert_eq!((cells[3].0, cells[3].1), (1, 0));
        assert_eq!(cells[5].2.north, 19.0);
        assert_eq!(cells[5].2.east, 74.5);
        assert_eq!(cells[0].2.center(), (18.25, 73.25));
    }

    #[test]
    fn inverted_grid_is_invalid() {
        let grid = GridSpec {
            south: 19.0,
            west: 73.0,
            north: 18.0,
            east: 74.0,
            rows: 2,
            cols: 2,
        };
        assert!(SearchSpec::for_grid("cafes", grid).validate().is_err());
    }

    #[test]
    fn filters_drop_low_quality_candidates() {
        let filters = PostFilters {
            min_rating: Some(4.0),
            require_phone: true,
            categories: vec!["dent".into()],
            ..Default::default()
        };
        let mut fields = LeadFields {
            business_name: "Smile Care".into(),
            rating: Some(4.5),
            phone: Some("9876543210".into()),
            category: Some("Dentist".into()),
            ..Default::default()
        };
        assert!(filters.admits(&fields));

        fields.rating = Some(3.9);
        assert!(!filters.admits(&fields));
        fields.rating = Some(4.1);
        fields.category = Some("Bakery".into());
        assert!(!filters.admits(&fields));
    }

    #[test]
    fn field_selection_clears_unselected() {
        let selection = FieldSelection {
            phone: false,
            socials: false,
            ..FieldSelection::all()
        };
        let mut fields = LeadFields {
            business_name: "Smile Care".into(),
            phone: Some("9876543210".into()),
            website: Some("https://smile.example".into()),
            ..Default::default()
        };
        fields.socials.insert("facebook".into(), "fb.com/smile".into());
        selection.apply(&mut fields);
        assert!(fields.phone.is_none());
        assert!(fields.socials.is_empty());
        assert!(fields.website.is_some());
        assert!(selection.is_subset_of(&FieldSelection::all()));
        assert!(!FieldSelection::all().is_subset_of(&selection));
    }
}
