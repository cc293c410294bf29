/// Maps CMS entries onto the search model.
///
/// Content types: `doctor` (name, specialty, department), `facility` (name or title,
/// slug, shortDescription) and `healthPackage` (name or title, category). Entries
/// without a usable title are skipped.
use async_trait::async_trait;
use hospital_common::contentful::{ContentfulClient, Entry};
use hospital_common::http::UpstreamError;

use crate::search::{ContentSource, DoctorHit, FacilityHit, PackageHit};

const DOCTOR_TYPE: &str = "doctor";
const FACILITY_TYPE: &str = "facility";
const PACKAGE_TYPE: &str = "healthPackage";

#[async_trait]
impl ContentSource for ContentfulClient {
    async fn doctors(&self, query: &str, limit: usize) -> Result<Vec<DoctorHit>, UpstreamError> {
        let entries = self.entries(DOCTOR_TYPE, query, limit).await?;
        Ok(entries.iter().filter_map(doctor_hit).collect())
    }

    async fn facilities(&self, query: &str, limit: usize) -> Result<Vec<FacilityHit>, UpstreamError> {
        let entries = self.entries(FACILITY_TYPE, query, limit).await?;
        Ok(entries.iter().filter_map(facility_hit).collect())
    }

    async fn packages(&self, query: &str, limit: usize) -> Result<Vec<PackageHit>, UpstreamError> {
        let entries = self.entries(PACKAGE_TYPE, query, limit).await?;
        Ok(entries.iter().filter_map(package_hit).collect())
    }
}

fn title(entry: &Entry) -> Option<String> {
    entry
        .text("name")
        .or_else(|| entry.text("title"))
        .map(str::to_string)
}

fn doctor_hit(entry: &Entry) -> Option<DoctorHit> {
    Some(DoctorHit {
        id: entry.sys.id.clone(),
        name: title(entry)?,
        specialty: entry.text("specialty").map(str::to_string),
        department: entry.text("department").map(str::to_string),
    })
}

fn facility_hit(entry: &Entry) -> Option<FacilityHit> {
    Some(FacilityHit {
        id: entry.sys.id.clone(),
        name: title(entry)?,
        slug: entry.text("slug").map(str::to_string),
        summary: entry.text("shortDescription").map(str::to_string),
    })
}

fn package_hit(entry: &Entry) -> Option<PackageHit> {
    Some(PackageHit {
        id: entry.sys.id.clone(),
        name: title(entry)?,
        category: entry.text("category").map(str::to_string),
    })
}
