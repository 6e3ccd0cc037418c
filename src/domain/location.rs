use crate::domain::models::Activity;

pub const UNKNOWN_LOCATION: &str = "Unknown";

/// Turns an activity into the location token handed to the distance resolver.
pub trait LocationResolver: Send + Sync {
    fn location_token(&self, activity: &Activity) -> String;
}

/// Structured city, then the city part of the address, then host/company.
#[derive(Debug, Clone, Copy, Default)]
pub struct CityTokenResolver;

impl LocationResolver for CityTokenResolver {
    fn location_token(&self, activity: &Activity) -> String {
        let city = activity.location.city.as_deref().map(str::trim).unwrap_or_default();
        if !city.is_empty() {
            return city.to_string();
        }

        let address = activity.location.address.trim();
        if !address.is_empty() {
            // "Company, City" / "Street, City, State"
            let parts = address.split(',').map(str::trim).collect::<Vec<_>>();
            if parts.len() >= 2 && !parts[1].is_empty() {
                return parts[1].to_string();
            }
            return address.to_string();
        }

        activity
            .host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .unwrap_or(UNKNOWN_LOCATION)
            .to_string()
    }
}
