//! Descriptors for the ESI routes the engine reads.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Path relative to the API base, with a trailing slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub paginated: bool,
    pub authenticated: bool,
}

impl Endpoint {
    pub fn public(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            paginated: false,
            authenticated: false,
        }
    }

    pub fn authenticated(path: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            ..Self::public(path)
        }
    }

    pub fn paginated(mut self) -> Self {
        self.paginated = true;
        self
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Stable key for response caching.
    pub fn cache_key(&self) -> String {
        let mut key = self.path.clone();
        for (k, v) in &self.query {
            key.push(if key.contains('?') { '&' } else { '?' });
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    pub fn character(character_id: i64) -> Self {
        Self::public(format!("characters/{character_id}/"))
    }

    pub fn corporation(corporation_id: i64) -> Self {
        Self::public(format!("corporations/{corporation_id}/"))
    }

    pub fn blueprints(character_id: i64) -> Self {
        Self::authenticated(format!("characters/{character_id}/blueprints/")).paginated()
    }

    pub fn planets(character_id: i64) -> Self {
        Self::authenticated(format!("characters/{character_id}/planets/"))
    }

    pub fn contracts(character_id: i64) -> Self {
        Self::authenticated(format!("characters/{character_id}/contracts/")).paginated()
    }

    pub fn contract_items(character_id: i64, contract_id: i64) -> Self {
        Self::authenticated(format!(
            "characters/{character_id}/contracts/{contract_id}/items/"
        ))
    }

    pub fn public_contracts(region_id: i64) -> Self {
        Self::public(format!("contracts/public/{region_id}/")).paginated()
    }

    pub fn public_contract_items(contract_id: i64) -> Self {
        Self::public(format!("contracts/public/items/{contract_id}/")).paginated()
    }

    pub fn station(station_id: i64) -> Self {
        Self::public(format!("universe/stations/{station_id}/"))
    }

    pub fn structure(structure_id: i64) -> Self {
        Self::authenticated(format!("universe/structures/{structure_id}/"))
    }

    pub fn system(system_id: i64) -> Self {
        Self::public(format!("universe/systems/{system_id}/"))
    }

    pub fn constellation(constellation_id: i64) -> Self {
        Self::public(format!("universe/constellations/{constellation_id}/"))
    }
}
