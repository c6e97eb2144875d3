//! Built-in module table for the warehouse back-office client.

use modgate_auth::PermissionName;
use modgate_core::ConfigurationError;

use crate::{MenuEntry, ModuleDescriptor, ModuleRegistry};

/// Version of the built-in table. Bump whenever a module, edge or permission
/// changes.
pub const CATALOG_VERSION: &str = "2024.3";

pub const DASHBOARD_READ: PermissionName = PermissionName::from_static("dashboard.read");
pub const PRODUCTS_READ: PermissionName = PermissionName::from_static("products.read");
pub const WAREHOUSES_READ: PermissionName = PermissionName::from_static("warehouses.read");
pub const INVENTORY_READ: PermissionName = PermissionName::from_static("inventory.read");
pub const ORDERS_READ: PermissionName = PermissionName::from_static("orders.read");
pub const PICKING_READ: PermissionName = PermissionName::from_static("picking.read");
pub const PACKING_READ: PermissionName = PermissionName::from_static("packing.read");
pub const SHIPMENTS_READ: PermissionName = PermissionName::from_static("shipments.read");
pub const RETURNS_READ: PermissionName = PermissionName::from_static("returns.read");
pub const REPORTS_READ: PermissionName = PermissionName::from_static("reports.read");
pub const USERS_READ: PermissionName = PermissionName::from_static("users.read");
pub const USERS_MANAGE: PermissionName = PermissionName::from_static("users.manage");
pub const SETTINGS_MANAGE: PermissionName = PermissionName::from_static("settings.manage");

/// The built-in descriptors, in menu-independent registration order.
pub fn default_modules() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new("tracking", "Shipment Tracking")
            .describe("Public parcel tracking by tracking number")
            .route("/track")
            .route("/track/:tracking_number"),
        ModuleDescriptor::new("dashboard", "Dashboard")
            .describe("Operational overview")
            .requires([DASHBOARD_READ])
            .route("/")
            .menu(MenuEntry::new("Dashboard", "layout-dashboard", "/", 0)),
        ModuleDescriptor::new("products", "Products")
            .describe("Product catalog and SKUs")
            .requires([PRODUCTS_READ])
            .route("/products")
            .route("/products/:id")
            .menu(MenuEntry::new("Products", "package", "/products", 10)),
        ModuleDescriptor::new("warehouses", "Warehouses")
            .describe("Warehouses, zones and bin locations")
            .requires([WAREHOUSES_READ])
            .route("/warehouses")
            .route("/warehouses/:id")
            .menu(MenuEntry::new("Warehouses", "warehouse", "/warehouses", 20)),
        ModuleDescriptor::new("inventory", "Inventory")
            .describe("Stock levels per warehouse location")
            .depends_on(["products", "warehouses"])
            .requires([INVENTORY_READ])
            .route("/inventory")
            .route("/inventory/adjustments")
            .menu(MenuEntry::new("Inventory", "boxes", "/inventory", 30)),
        ModuleDescriptor::new("orders", "Orders")
            .describe("Customer orders")
            .depends_on(["products"])
            .requires([ORDERS_READ])
            .route("/orders")
            .route("/orders/:id")
            .menu(MenuEntry::new("Orders", "shopping-cart", "/orders", 40)),
        ModuleDescriptor::new("picking", "Picking")
            .describe("Pick lists generated from open orders")
            .depends_on(["orders", "inventory"])
            .requires([PICKING_READ])
            .route("/picking")
            .menu(MenuEntry::new("Picking", "hand", "/picking", 50)),
        ModuleDescriptor::new("packing", "Packing")
            .describe("Packing stations and parcel contents")
            .depends_on(["picking"])
            .requires([PACKING_READ])
            .route("/packing")
            .menu(MenuEntry::new("Packing", "package-check", "/packing", 60)),
        ModuleDescriptor::new("shipments", "Shipments")
            .describe("Outbound shipments and carriers")
            .depends_on(["orders"])
            .requires([SHIPMENTS_READ])
            .route("/shipments")
            .route("/shipments/:id")
            .menu(MenuEntry::new("Shipments", "truck", "/shipments", 70)),
        ModuleDescriptor::new("returns", "Returns")
            .describe("Return authorizations and restocking")
            .depends_on(["orders", "inventory"])
            .requires([RETURNS_READ])
            .route("/returns")
            .menu(MenuEntry::new("Returns", "undo-2", "/returns", 80)),
        ModuleDescriptor::new("reports", "Reports")
            .describe("Throughput and stock reports")
            .depends_on(["orders", "inventory"])
            .requires([REPORTS_READ])
            .route("/reports")
            .menu(MenuEntry::new("Reports", "bar-chart-3", "/reports", 90)),
        ModuleDescriptor::new("users", "Users")
            .describe("User accounts and role assignment")
            .requires([USERS_READ, USERS_MANAGE])
            .route("/admin/users")
            .menu(MenuEntry::new("Users", "users", "/admin/users", 100)),
        ModuleDescriptor::new("settings", "Settings")
            .describe("Tenant-wide configuration")
            .requires([SETTINGS_MANAGE])
            .route("/admin/settings")
            .menu(MenuEntry::new("Settings", "settings", "/admin/settings", 110)),
    ]
}

/// The built-in registry.
pub fn default_registry() -> Result<ModuleRegistry, ConfigurationError> {
    ModuleRegistry::new(CATALOG_VERSION, default_modules())
}
