use uuid::Uuid;

/// Tenant scope handed to every store call.
///
/// `Global` is single-tenant mode: no filtering at all. `Tenant` restricts
/// reads to rows carrying that tenant id and stamps it on every insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TenantContext {
    #[default]
    Global,
    Tenant(Uuid),
}

impl TenantContext {
    // Scope for work derived from an existing row (scheduler, reconciliation)
    pub fn for_row(tenant_id: Option<Uuid>) -> Self {
        match tenant_id {
            Some(id) => TenantContext::Tenant(id),
            None => TenantContext::Global,
        }
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            TenantContext::Global => None,
            TenantContext::Tenant(id) => Some(*id),
        }
    }

    pub fn allows(&self, row_tenant: Option<Uuid>) -> bool {
        match self {
            TenantContext::Global => true,
            TenantContext::Tenant(id) => row_tenant == Some(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_scope_sees_every_row() {
        let ctx = TenantContext::Global;
        assert!(ctx.allows(None));
        assert!(ctx.allows(Some(Uuid::new_v4())));
    }

    #[test]
    fn tenant_scope_only_sees_its_own_rows() {
        let tenant = Uuid::new_v4();
        let ctx = TenantContext::Tenant(tenant);
        assert!(ctx.allows(Some(tenant)));
        assert!(!ctx.allows(Some(Uuid::new_v4())));
        assert!(!ctx.allows(None));
        assert_eq!(TenantContext::for_row(Some(tenant)), ctx);
    }
}
