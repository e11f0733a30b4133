// https://www.geopackage.org/spec130/#table_definition_sql

pub(crate) const CREATE_SPATIAL_REF_SYS_TABLE: &str = "CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
        srs_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL PRIMARY KEY,
        organization TEXT NOT NULL,
        organization_coordsys_id INTEGER NOT NULL,
        definition TEXT NOT NULL,
        description TEXT
    )";

pub(crate) const CREATE_CONTENTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS gpkg_contents (
        table_name TEXT NOT NULL PRIMARY KEY,
        data_type TEXT NOT NULL,
        identifier TEXT UNIQUE,
        description TEXT DEFAULT '',
        last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
        min_x DOUBLE,
        min_y DOUBLE,
        max_x DOUBLE,
        max_y DOUBLE,
        srs_id INTEGER,
        CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
    )";

pub(crate) const CREATE_GEOMETRY_COLUMNS_TABLE: &str = "CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
        table_name TEXT NOT NULL,
        column_name TEXT NOT NULL,
        geometry_type_name TEXT NOT NULL,
        srs_id INTEGER NOT NULL,
        z TINYINT NOT NULL,
        m TINYINT NOT NULL,
        CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
        CONSTRAINT uk_gc_table_name UNIQUE (table_name),
        CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
        CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys (srs_id)
    )";

pub(crate) const CREATE_EXTENSIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS gpkg_extensions (
        table_name TEXT,
        column_name TEXT,
        extension_name TEXT NOT NULL,
        definition TEXT NOT NULL,
        scope TEXT NOT NULL,
        CONSTRAINT ge_tce UNIQUE (table_name, column_name, extension_name)
    )";

/// `application_id` of a GeoPackage, "GPKG" in ASCII.
pub(crate) const APPLICATION_ID: u32 = 0x4750_4B47;
/// Application ids written by GeoPackage 1.0 ("GP10") and 1.1 ("GP11").
pub(crate) const LEGACY_APPLICATION_IDS: [u32; 2] = [0x4750_3130, 0x4750_3131];
/// `user_version` written to new files, GeoPackage 1.3.0.
pub(crate) const USER_VERSION: u32 = 10300;
/// `user_version` values of the GeoPackage releases this crate reads.
pub(crate) const KNOWN_USER_VERSIONS: [u32; 5] = [10200, 10201, 10300, 10301, 10400];
